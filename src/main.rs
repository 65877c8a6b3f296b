//! Replica node - Binary Entry Point
//!
//! Opens one store and drives it from stdin. Each line is either a SQL
//! write or a dot command; every reply is one JSON line on stdout.
//!
//! The node builds its own in-process bus and a lease registry with
//! itself as the only member, so it always leads and never replicates to
//! another process. Running two nodes against the same data directory
//! does not make them coordinate; multi-client setups live inside one
//! process, sharing one `LocalBus` and one `LeaseRegistry`.
//!
//! ```text
//! INSERT INTO notes(id, title) VALUES ('n1', 'Hello')
//! .query SELECT * FROM notes
//! .role | .status | .persist | .quit
//! ```

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use replica_sync::{
    Client, ClientDeps, FileSlotStore, LeaseRegistry, LocalBus, PersistOutcome, ScalarValue,
    SqliteFactory, SyncConfig, SyncResult,
};

#[tokio::main]
async fn main() -> SyncResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let store = std::env::args().nth(1).unwrap_or_else(|| "notes".to_string());
    let config = SyncConfig::from_env();
    let client_id = format!("node-{}", Uuid::new_v4().simple());

    let bus = LocalBus::new(config.channel_capacity);
    let registry = LeaseRegistry::default();
    let deps = ClientDeps::new(
        Arc::new(SqliteFactory::new(config.stores_dir())),
        Arc::new(bus.endpoint()),
        Arc::new(registry.join(&client_id)),
        Arc::new(FileSlotStore::open(config.slots_dir())?),
    );

    let client = Client::open_store(&store, config, deps).await?;
    info!(store = %store, client = %client_id, "ready, reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ".quit" {
                    break;
                }
                println!("{}", handle_command(&client, trimmed));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(e) = client.shutdown() {
        error!(error = %e, "final persist failed");
        return Err(e);
    }
    Ok(())
}

/// Execute one input line and describe the result
fn handle_command(client: &Client, line: &str) -> Value {
    let result: SyncResult<Value> = match line.split_once(char::is_whitespace).unwrap_or((line, "")) {
        (".role", _) => serde_json::to_value(client.current_role()).map_err(Into::into),
        (".status", _) => serde_json::to_value(client.status()).map_err(Into::into),
        (".persist", _) => client.force_persist().map(|outcome| match outcome {
            PersistOutcome::Written(bytes) => json!({ "persisted": bytes }),
            PersistOutcome::NotLeader => json!({ "persisted": null, "reason": "not leader" }),
        }),
        (".query", sql) => client.query(sql, &[]).map(|rows| {
            let rows: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| row.iter().map(scalar_to_json).collect())
                .collect();
            json!({ "rows": rows })
        }),
        (cmd, _) if cmd.starts_with('.') => Ok(json!({ "error": format!("unknown command {}", cmd) })),
        _ => client.write(line, Vec::new()).map(|changed| json!({ "changed": changed })),
    };

    result.unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

fn scalar_to_json(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Null => Value::Null,
        ScalarValue::Integer(v) => json!(v),
        ScalarValue::Real(v) => json!(v),
        ScalarValue::Text(v) => json!(v),
        ScalarValue::Blob(v) => json!({ "blobLength": v.len() }),
    }
}
