//! End-to-end walk through insert, list and search.

use anyhow::Result;
use fieldseal::prelude::*;
use fieldseal_local::LocalProvider;

const TABLE: &str = "users";

pub(crate) async fn run(config: &Config) -> Result<()> {
    let provider = LocalProvider::generate();
    let codec = Codec::new(provider, config.limits.clone());
    let orchestrator = Orchestrator::new(codec, config.schema());
    let client = Client::new(orchestrator, MemoryStore::new());

    let stored = client
        .insert(TABLE, Record::new(1).with("email", "a@x.com").with("name", "Alice"))
        .await?;
    client.insert(TABLE, Record::new(2).with("email", "b@y.org").with("name", "Bob")).await?;
    println!("Stored row 1:\n{}\n", serde_json::to_string_pretty(&stored)?);

    println!("All users:");
    print_batch(client.list(TABLE).await?);

    let searches = [
        ("email ilike 'a@x.com'", vec![Filter::like("email", "a@x.com")]),
        ("name = 'Bob'", vec![Filter::eq("name", "Bob")]),
        ("email ilike '%@nowhere%'", vec![Filter::like("email", "%@nowhere%")]),
    ];
    for (label, filters) in searches {
        println!("\nWhere {label}:");
        print_batch(client.search(TABLE, &filters, Combine::Any).await?);
    }
    Ok(())
}

fn print_batch(batch: BatchResult<Record>) {
    if batch.is_empty() {
        println!("  (no rows)");
    }
    for item in batch {
        match item {
            Ok(record) => {
                let fields: Vec<String> = record
                    .fields()
                    .filter_map(|(column, _)| record.plain(column).map(|v| format!("{column}={v}")))
                    .collect();
                println!("  {} {}", record.id(), fields.join(" "));
            }
            Err(err) => println!("  error: {err}"),
        }
    }
}
