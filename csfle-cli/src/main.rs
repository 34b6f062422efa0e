//! `csfle` CLI for master key generation, key bootstrap and schema inspection.
//!
//! Settings come from the environment; a `.env` file in the working
//! directory is loaded first. Set `RUST_LOG=info` to see bootstrap
//! transitions.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use csfle::config::MASTER_KEY_FILE;
use csfle::prelude::*;
use csfle_derive::EncryptedFields;
use csfle_kms_aws::AwsKms;
use csfle_store_file::FileConnector;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "csfle")]
#[command(about = "Client-side field-level encryption key management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new local master key file
    Keygen {
        /// Output file (defaults to MASTER_KEY_FILE, then ./master-key.txt)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resolve or provision the data key and verify with a demo customer
    Bootstrap,
    /// Print the encryption schema for the existing data key
    Schema,
}

/// Demo document written during bootstrap.
#[derive(Serialize, EncryptedFields)]
struct Customer {
    name: String,
    #[encrypt(algorithm = "deterministic", bson_type = "string")]
    ssn: String,
    #[encrypt(algorithm = "random", bson_type = "string")]
    prescription: String,
    email: String,
}

impl Customer {
    fn demo() -> Self {
        Self {
            name: "Jon Doe".to_string(),
            ssn: "123-45-6789".to_string(),
            prescription: "Lisinopril".to_string(),
            email: "jon.doe@example.com".to_string(),
        }
    }
}

fn connector() -> Arc<dyn Connector> {
    Arc::new(
        SchemeRouter::new()
            .with("memory", Arc::new(MemoryConnector::new()))
            .with("file", Arc::new(FileConnector)),
    )
}

fn field_specs(settings: &Settings) -> Vec<FieldSpec> {
    settings.encrypted_fields().map_or_else(Customer::field_specs, <[FieldSpec]>::to_vec)
}

fn kms(bootstrap: &Bootstrap) -> Result<Arc<dyn Kms>> {
    let settings = bootstrap.settings();
    let kms: Arc<dyn Kms> = match settings.kms_provider() {
        KmsProvider::Local { .. } => Arc::new(bootstrap.local_kms()?),
        provider @ KmsProvider::Aws { .. } => Arc::new(AwsKms::from_provider(
            provider,
            settings.connection().operation_timeout(),
        )?),
    };
    Ok(kms)
}

fn keygen(output: Option<PathBuf>) -> Result<()> {
    let path = output
        .or_else(|| std::env::var_os(MASTER_KEY_FILE).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("master-key.txt"));
    MasterKeySource::local()
        .generate(&path)
        .with_context(|| format!("failed to generate master key at {}", path.display()))?;
    println!("Wrote {}-byte master key to {}", MasterKeySource::local().expected_len(), path.display());
    Ok(())
}

fn bootstrap() -> Result<()> {
    let settings = Settings::from_env().context("invalid settings")?;
    let fields = field_specs(&settings);
    let bootstrap = Bootstrap::new(settings, EncryptedClientFactory::new(connector()));
    let kms = kms(&bootstrap)?;

    let sample = match serde_json::to_value(Customer::demo())? {
        serde_json::Value::Object(map) => map,
        _ => bail!("demo customer did not serialize to a document"),
    };

    let report = bootstrap.run(kms, &fields, sample).context("key resolution failed")?;
    let origin = match report.key.origin {
        KeyOrigin::Existing => "existing",
        KeyOrigin::Provisioned => "provisioned",
    };
    println!("Data key: {} ({origin})", report.key.key_id);

    if let Some(schema) = &report.schema {
        println!("Schema for {}:", bootstrap.settings().target());
        println!("{}", serde_json::to_string_pretty(&schema.to_json_schema())?);
    }

    let verification = report.verification.context("verification failed")?;
    println!("Read through the encrypted client:");
    println!("{}", serde_json::to_string_pretty(&verification.decrypted)?);
    println!("Stored document as seen by a plain client:");
    println!("{}", serde_json::to_string_pretty(&verification.stored)?);
    if !verification.all_protected_opaque() {
        bail!("a protected field was stored in readable form");
    }
    println!("{} protected field(s) stored as ciphertext", verification.protected.len());
    Ok(())
}

fn schema() -> Result<()> {
    let settings = Settings::from_env().context("invalid settings")?;
    let fields = field_specs(&settings);
    let bootstrap = Bootstrap::new(settings, EncryptedClientFactory::new(connector()));

    let Some(schema) = bootstrap.existing_schema(&fields)? else {
        bail!(
            "no data key named {:?} in {}; run `csfle bootstrap` first",
            bootstrap.settings().key_alt_name(),
            bootstrap.settings().key_vault()
        );
    };
    println!("{}", serde_json::to_string_pretty(&schema.to_json_schema())?);
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen { output } => keygen(output),
        Commands::Bootstrap => bootstrap(),
        Commands::Schema => schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_customer_fields() {
        let specs = Customer::field_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].path(), "ssn");
        assert_eq!(specs[1].algorithm(), "random");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["csfle", "keygen", "--output", "key.bin"]);
        assert!(matches!(cli.command, Commands::Keygen { output: Some(p) } if p == PathBuf::from("key.bin")));
        assert!(matches!(Cli::parse_from(["csfle", "schema"]).command, Commands::Schema));
    }
}
