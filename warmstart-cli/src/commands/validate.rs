// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `warmstart validate` command - Validate configuration file.

use warmstart_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let orch = &config.orchestrator;
            println!("✓ Configuration is valid");
            println!();
            println!("Orchestrator Settings:");
            println!("  Snapshots:          {}", if orch.snapshots_enabled { "enabled" } else { "disabled" });
            println!("  Snapshot Directory: {}", orch.snapshot_dir.display());
            println!("  Snapshotter:        {}", orch.snapshotter);
            println!(
                "  Machine:            {} vCPU, {} MiB",
                orch.machine.vcpu_count, orch.machine.mem_size_mib
            );
            println!("  Network:            {}", orch.network);
            println!(
                "  Host Interface:     {}",
                if orch.host_iface.is_empty() { "(default route)" } else { orch.host_iface.as_str() }
            );
            println!();
            println!("Timeouts:");
            println!("  Cold Boot:          {:?}", orch.timeouts.cold_boot);
            println!("  Snapshot:           {:?}", orch.timeouts.snapshot);
            println!("  Restore:            {:?}", orch.timeouts.restore);
            println!("  Teardown:           {:?}", orch.timeouts.teardown);
            println!();
            println!("DNS:");
            println!("  Cluster Lookup:     {}", orch.dns.cluster_lookup);
            for ns in &orch.dns.fallback {
                println!("  - {}", ns);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
