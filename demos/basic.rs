//! Basic usage example for docsaga
//!
//! This example demonstrates:
//! - Registering a model for the mapped backend
//! - Running a task that commits
//! - Running a task that fails and is rolled back

use docsaga::{Engine, ExecutionMode, FieldKind, Options, Schema, Store};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init();

    let engine = Engine::in_memory(Options::default())?;
    engine.init_model(
        "accounts",
        Schema::new()
            .required("owner", FieldKind::String)
            .required("balance", FieldKind::Number),
    )?;

    // Open two accounts and move money between them
    println!("Running transfer...");
    let mut task = engine.task();
    task.save("accounts", json!({"_id": "alice", "owner": "Alice", "balance": 100}))?
        .save("accounts", json!({"_id": "bob", "owner": "Bob", "balance": 0}))?
        .update("accounts", json!({"_id": "alice"}), json!({"$inc": {"balance": -30}}))?
        .update("accounts", json!({"_id": "bob"}), json!({"$inc": {"balance": 30}}))?;
    let results = task.run(ExecutionMode::Mapped)?;
    println!("Committed {} steps", results.len());

    // The second save violates the schema, so the first is undone
    println!("Running a task that fails...");
    let mut task = engine.task();
    task.save("accounts", json!({"_id": "carol", "owner": "Carol", "balance": 5}))?
        .save("accounts", json!({"_id": "dave", "balance": "lots"}))?;
    match task.run_default() {
        Ok(_) => println!("unexpected success"),
        Err(err) => println!("Rolled back: {}", err),
    }

    for account in engine.store().find("accounts", &Default::default(), None)? {
        println!("{}", serde_json::Value::Object(account));
    }

    Ok(())
}
