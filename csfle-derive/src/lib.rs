//! Derive macro for declaring the encrypted fields of a document type.

#![warn(clippy::pedantic, clippy::nursery)]

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::ext::IdentExt;
use syn::{parse_macro_input, Data, DeriveInput, Field, Fields, LitStr};

/// Derives `csfle::schema::EncryptedFields` from `#[encrypt(...)]` attributes.
///
/// Each annotated field becomes one field spec. `algorithm` is required;
/// `bson_type` is required for deterministic fields; `path` overrides the
/// stored path (use it for nested fields such as `insurance.policyNumber`).
/// Unannotated fields are stored as-is.
///
/// # Example
///
/// ```rust,ignore
/// use csfle::schema::EncryptedFields;
/// use csfle_derive::EncryptedFields;
///
/// #[derive(EncryptedFields)]
/// struct Patient {
///     name: String,
///     #[encrypt(algorithm = "deterministic", bson_type = "string")]
///     ssn: String,
///     #[encrypt(algorithm = "random", bson_type = "int", path = "insurance.policyNumber")]
///     policy_number: i32,
/// }
///
/// assert_eq!(Patient::field_specs().len(), 2);
/// ```
#[proc_macro_derive(EncryptedFields, attributes(encrypt))]
pub fn derive_encrypted_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input).unwrap_or_else(syn::Error::into_compile_error).into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "EncryptedFields can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "EncryptedFields requires named fields",
        ));
    };

    let mut specs = Vec::new();
    for field in &fields.named {
        if let Some(spec) = field_spec(field)? {
            specs.push(spec);
        }
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::csfle::schema::EncryptedFields for #name #ty_generics #where_clause {
            fn field_specs() -> ::std::vec::Vec<::csfle::schema::FieldSpec> {
                ::std::vec![#(#specs),*]
            }
        }
    })
}

fn field_spec(field: &Field) -> syn::Result<Option<TokenStream2>> {
    let mut found = None;
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("encrypt")) {
        if found.is_some() {
            return Err(syn::Error::new_spanned(attr, "duplicate #[encrypt] attribute"));
        }

        let mut algorithm: Option<LitStr> = None;
        let mut bson_type: Option<LitStr> = None;
        let mut path: Option<LitStr> = None;
        attr.parse_nested_meta(|meta| {
            let slot = if meta.path.is_ident("algorithm") {
                &mut algorithm
            } else if meta.path.is_ident("bson_type") {
                &mut bson_type
            } else if meta.path.is_ident("path") {
                &mut path
            } else {
                return Err(meta.error("expected `algorithm`, `bson_type` or `path`"));
            };
            *slot = Some(meta.value()?.parse()?);
            Ok(())
        })?;

        let algorithm = algorithm
            .ok_or_else(|| syn::Error::new_spanned(attr, "#[encrypt] requires `algorithm`"))?;
        let path = match path {
            Some(path) => path.value(),
            None => field.ident.as_ref().map(|i| i.unraw().to_string()).unwrap_or_default(),
        };

        found = Some(bson_type.map_or_else(
            || quote! { ::csfle::schema::FieldSpec::new(#path, #algorithm) },
            |bson_type| {
                quote! { ::csfle::schema::FieldSpec::new(#path, #algorithm).with_bson_type(#bson_type) }
            },
        ));
    }
    Ok(found)
}
