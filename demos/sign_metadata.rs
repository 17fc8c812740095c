//! Example: Generating and verifying a director metadata chain
//!
//! Run with: cargo run --example sign_metadata

use std::collections::BTreeMap;
use uptane_core::metadata::{
    generate_root, generate_snapshot, generate_targets, generate_timestamp, verify_snapshot_reference,
    verify_timestamp_reference, TargetFormat, TargetsCustom,
};
use uptane_core::{crypto, EcuSerial, HardwareId, Role, Signer, TargetBuilder, Ttl};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🤖 Robot OTA - Metadata Signing Example\n");
    println!("==============================================\n");

    // Step 1: Generate one key per role (in production, these live in key custody)
    println!("1️⃣  Generating role keys...");
    let root_key = Signer::generate()?;
    let targets_key = Signer::generate()?;
    let snapshot_key = Signer::generate()?;
    let timestamp_key = Signer::generate()?;
    println!("   ✓ Root key id: {}...\n", &root_key.key_id()[..16]);

    // Step 2: Root delegates each role to its key
    println!("2️⃣  Generating root metadata...");
    let root = generate_root(
        Ttl::years(1),
        1,
        false,
        &root_key,
        targets_key.public_key(),
        snapshot_key.public_key(),
        timestamp_key.public_key(),
    )?;
    println!("   ✓ Root v{} expires {}\n", root.signed.version, root.signed.expires);

    // Step 3: Assign an image to a secondary ECU
    println!("3️⃣  Generating director targets for robot ROBOT-001...");
    let firmware = b"secondary-firmware-v2.0.0";
    let entry = TargetBuilder::new()
        .length(firmware.len() as u64)
        .sha256(crypto::hash(firmware, crypto::HashAlgorithm::Sha256))
        .sha512(Some(crypto::hash(firmware, crypto::HashAlgorithm::Sha512)))
        .format(TargetFormat::Binary)
        .uri("https://gateway.example/images/fw-2.0.0")
        .ecu(EcuSerial("SECONDARY-1".to_string()), HardwareId("arm-mcu".to_string()))
        .build()?;

    let mut targets = BTreeMap::new();
    targets.insert("fw-2.0.0".to_string(), entry);
    let targets = generate_targets(
        Ttl::days(7),
        1,
        &targets_key,
        targets,
        Some(TargetsCustom {
            correlation_id: "rollout-robot-1".to_string(),
        }),
    )?;
    println!("   ✓ Targets v{} with {} target(s)\n", targets.signed.version, targets.signed.targets.len());

    // Step 4: Pin targets from snapshot, and snapshot from timestamp
    println!("4️⃣  Generating snapshot and timestamp...");
    let snapshot = generate_snapshot(Ttl::days(7), 1, &snapshot_key, &targets)?;
    let timestamp = generate_timestamp(Ttl::days(1), 1, &timestamp_key, &snapshot)?;
    let pinned = &snapshot.signed.meta[Role::Targets.filename()];
    println!("   ✓ targets.json pinned: v{} / {} bytes / {}...\n", pinned.version, pinned.length, &pinned.hashes.sha256[..16]);

    // Step 5: Verify the chain as a robot would
    println!("5️⃣  Verifying chain...");
    let trusted = root.signed.role_key(Role::Targets)?;
    println!("   ✓ Root signature: {}", root.verify(root_key.public_key()));
    println!("   ✓ Targets signature: {}", targets.verify(&trusted));
    verify_snapshot_reference(&snapshot, &targets)?;
    verify_timestamp_reference(&timestamp, &snapshot)?;
    println!("   ✅ Snapshot and timestamp references VALID\n");

    println!("==============================================");
    println!("✅ Metadata workflow complete!");
    println!("\nNext steps:");
    println!("  - Robot fetches timestamp.json, then snapshot.json, then targets.json");
    println!("  - Robot installs fw-2.0.0 on SECONDARY-1");
    println!("  - Robot reports back: PUT /manifest");

    Ok(())
}
