//! Basic usage example for `csfle`: provision a data key, build a schema and
//! compare what an encrypted and a plain client see.

use csfle::bootstrap::resolve_key;
use csfle::prelude::*;
use serde_json::json;
use std::net::TcpListener;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("csfle Basic Usage Example");
    println!("=========================\n");

    // An in-process store and a local master key
    let store = MemoryStore::new();
    let kms: Arc<dyn Kms> = Arc::new(LocalKms::new(MasterKeyMaterial::new(vec![0x42; 96], 96)?)?);
    let key_vault = Namespace::new("encryption", "__keyVault")?;
    let target = Namespace::new("medicalRecords", "patients")?;

    // Resolve (or create) the data key
    let vault = KeyVaultManager::new(Arc::new(store.clone()), key_vault.clone());
    let key = resolve_key(&vault, kms.as_ref(), "demo-data-key")?;
    println!("✓ Data key {} ({:?})\n", key.key_id, key.origin);

    // Bind the sensitive fields to it
    let schema = build_schema(
        key.key_id,
        &[
            FieldSpec::new("ssn", "deterministic").with_bson_type("string"),
            FieldSpec::new("prescription", "random").with_bson_type("string"),
        ],
    )?;
    println!("Schema:\n{}\n", serde_json::to_string_pretty(&schema.to_json_schema())?);

    // A listening socket stands in for the crypto agent
    let agent = TcpListener::bind("127.0.0.1:0")?;
    let factory = EncryptedClientFactory::new(Arc::new(store));
    let connection = ConnectionOptions::new("memory://example");
    let client = factory.create_encrypted_client(EncryptedClientConfig {
        connection: connection.clone(),
        kms,
        key_vault,
        schema,
        crypto_agent: CryptoAgentLocator::Endpoint(agent.local_addr()?.to_string()),
        target: target.clone(),
    })?;

    let patient = json!({"name": "Jon Doe", "ssn": "123-45-6789", "prescription": "Lisinopril"});
    let Some(patient) = patient.as_object().cloned() else {
        return Err("sample is not a document".into());
    };
    let id = client.insert_one(patient)?;

    let mut by_ssn = Document::new();
    by_ssn.insert("ssn".to_string(), json!("123-45-6789"));
    println!("Encrypted client: {:?}\n", client.find_one(&by_ssn)?);

    let plain = factory.create_plain_client(&connection, target)?;
    let mut by_id = Document::new();
    by_id.insert("_id".to_string(), id);
    println!("Plain client:     {:?}", plain.find_one(&by_id)?);

    client.close();
    plain.close();
    Ok(())
}
