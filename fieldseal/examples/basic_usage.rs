//! Basic usage example for `fieldseal`.

use fieldseal::prelude::*;
use fieldseal_local::LocalProvider;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("fieldseal Basic Usage Example");
    println!("=============================\n");

    // Setup: open or create the key directory
    let key_dir = PathBuf::from("./example_keys");
    let provider = if key_dir.exists() {
        LocalProvider::open(&key_dir)?
    } else {
        println!("Initializing key directory at {}...", key_dir.display());
        LocalProvider::init(&key_dir)?
    };
    println!("✓ LocalProvider ready (key id {})\n", provider.key_id());

    // Declare which columns are encrypted and how they can be searched
    let schema = Schema::new().table(
        TablePolicy::new("users")
            .column(ColumnPolicy::new("users", "email").equality().free_text_search())
            .column(ColumnPolicy::new("users", "name").equality()),
    );
    let codec = Codec::new(provider, Limits::default());
    let client = Client::new(Orchestrator::new(codec, schema), MemoryStore::new());

    // Insert encrypts every declared column before it reaches the store
    let row = client
        .insert("users", Record::new(1).with("email", "alice@example.com").with("name", "Alice"))
        .await?;
    let bob = Record::new(2).with("email", "bob@example.org").with("name", "Bob");
    client.insert("users", bob).await?;
    println!("Stored row:\n{}\n", serde_json::to_string_pretty(&row)?);

    // Equality search goes through the unique index
    let found = client.search("users", &[Filter::eq("name", "Bob")], Combine::Any).await?;
    for record in found.successes() {
        let email = record.plain("email").map_or_else(String::new, ToString::to_string);
        println!("✓ name = 'Bob' -> id {} ({email})", record.id());
    }

    // Pattern search goes through the match index
    let filters = [Filter::like("email", "%@example.com")];
    let found = client.search("users", &filters, Combine::Any).await?;
    for record in found.successes() {
        println!("✓ email ilike '%@example.com' -> id {}", record.id());
    }

    // Unknown values yield an empty result
    let filters = [Filter::eq("email", "carol@example.com")];
    let found = client.search("users", &filters, Combine::Any).await?;
    assert!(found.is_empty());
    println!("✓ No match for carol@example.com\n");

    println!("=============================");
    println!("Note: Key directory at {} can be deleted manually", key_dir.display());

    Ok(())
}
