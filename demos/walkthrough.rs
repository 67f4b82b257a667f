//! # Presence-Gated Secret Walkthrough
//!
//! Drives a [`SecretWorkflow`] against the in-process keystore and a
//! scripted sensor:
//! 1. First use encrypts the secret
//! 2. A cancelled prompt changes nothing
//! 3. Later uses decrypt it again
//! 4. Enrolling a new finger invalidates the key and the old ciphertext
//!
//! Run with `RUST_LOG=biogate=debug` to see the keystore at work.

use std::sync::Arc;

use biogate::{
    CancelReason, Keystore, SecretObserver, SecretWorkflow, SimulatedSensor, TokenAuthority,
    Touch, WorkflowConfig,
};
use tracing_subscriber::EnvFilter;

struct Console;

impl SecretObserver for Console {
    fn on_secret_revealed(&self, plaintext: &[u8]) {
        println!("   🔓 revealed: {}", String::from_utf8_lossy(plaintext));
    }

    fn on_failure(&self, message: &str) {
        println!("   ❌ {message}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let authority = TokenAuthority::new();
    authority.enroll("right-index");
    let sensor = Arc::new(SimulatedSensor::new(authority.clone()));
    let workflow = SecretWorkflow::new(
        &WorkflowConfig::default(),
        Keystore::software(authority.clone()),
        sensor.clone(),
        Arc::new(Console),
        "hello",
    );

    println!("=== Presence-Gated Secret Demo ===\n");

    println!("1. First touch");
    sensor.script([Touch::Match]);
    let done = workflow.request_operation().await;
    println!("   -> {done:?}, state {:?}", workflow.state());
    if let Some(record) = workflow.record() {
        println!("   ciphertext is {} bytes", record.ciphertext().len());
    }

    println!("\n2. User taps Cancel");
    sensor.script([Touch::Cancel(CancelReason::NegativeButton)]);
    let done = workflow.request_operation().await;
    println!("   -> {done:?}, state {:?}", workflow.state());

    println!("\n3. One wrong finger, then the right one");
    sensor.script([Touch::Mismatch, Touch::Match]);
    let done = workflow.request_operation().await;
    println!("   -> {done:?}");

    println!("\n4. A new finger is enrolled");
    authority.enroll("left-thumb");
    let done = workflow.request_operation().await;
    println!("   -> {done:?}");

    match workflow.reprovision() {
        Ok(Some(_)) => println!("   old ciphertext discarded, key replaced"),
        Ok(None) => println!("   nothing to discard"),
        Err(e) => println!("   re-provisioning failed: {e}"),
    }

    sensor.script([Touch::Match]);
    let done = workflow.request_operation().await;
    println!("   -> {done:?}, state {:?}", workflow.state());

    println!("\n=== Demo Complete ===");
}
