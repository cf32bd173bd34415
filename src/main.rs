use anyhow::Result;
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lightmaster_rs::probe_client::{ProbeClient, ProbeClientConfig, ProbeHandle};
use lightmaster_rs::session::{PhaseConfig, PhaseDriver, PhasePlan};
use lightmaster_rs::types::ProbeEvent;

/// Read one line from the operator, or `None` when stdin closes or the
/// session is interrupted.
async fn read_line(
    lines: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Option<String> {
    tokio::select! {
        line = lines.recv() => line,
        _ = cancel.cancelled() => None,
    }
}

/// Run one phase and report its outcome; a failed phase never takes down the
/// menu loop.
async fn run_phase(
    plan: PhasePlan,
    config: &PhaseConfig,
    handle: &ProbeHandle,
    events: &mut mpsc::Receiver<ProbeEvent>,
    lines: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) {
    let driver = PhaseDriver::new(plan, config.clone());
    let report = driver.run(handle, events, lines, cancel).await;
    info!(
        "phase complete: {} record(s), {} iteration(s){}",
        report.records.len(),
        report.iterations_completed,
        if report.cancelled { ", interrupted" } else { "" }
    );
}

fn print_menu() {
    println!("\n--- Select Measurement Mode ---");
    println!("1. Halogen on White Reference Plate (Setup Verification)");
    println!("2. Sunlight on White Reference Plate (Sunlight Calibration)");
    println!("3. Measure Sample under Halogen");
    println!("4. Measure Sample under Sunlight");
    println!("5. Dump GATT Services and Characteristics");
    println!("6. Exit Program");
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose BLE diagnostics, e.g.:
    //   RUST_LOG=lightmaster_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ProbeClientConfig::default();
    let phase_config = PhaseConfig::default();

    // ── Connect ───────────────────────────────────────────────────────────────
    let client = ProbeClient::new(config);
    info!("Connecting to Opple Light Master Pro …");
    let (mut events, handle) = match client.connect().await {
        Ok(pair) => pair,
        Err(e) => {
            // Discovery/connect failures are fatal — there is no session
            // state to salvage, only remediation for the operator.
            error!("could not connect: {e:#}");
            eprintln!("Ensure the Light Master is powered on and ready to connect.");
            eprintln!("If still not found, cycle power on the device and toggle Bluetooth.");
            #[cfg(target_os = "linux")]
            eprintln!("On Linux, you may need elevated privileges or udev rules for BLE access.");
            std::process::exit(1);
        }
    };
    println!("Successfully connected to Opple Light Master Pro!");

    // ── Operator input ────────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points) and relayed over a channel.
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Interrupt handling ────────────────────────────────────────────────────
    // Ctrl-C finalizes the running phase with whatever it has buffered, then
    // ends the session cleanly.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nInterrupt received — finishing up …");
                cancel.cancel();
            }
        });
    }

    // ── Menu loop ─────────────────────────────────────────────────────────────
    while !cancel.is_cancelled() {
        print_menu();
        println!("Enter your choice (1-6): ");

        let Some(choice) = read_line(&mut lines, &cancel).await else {
            break;
        };

        match choice.as_str() {
            "1" => {
                let plan = PhasePlan::with_setup_note(
                    "halogen reference",
                    "Ensure the PTFE plate is in the sphere and the halogen is ON and stable.",
                );
                run_phase(plan, &phase_config, &handle, &mut events, &mut lines, &cancel).await;
            }
            "2" => {
                let plan = PhasePlan::with_setup_note(
                    "solar reference",
                    "Place the white reference plate in direct, unobstructed sunlight.",
                );
                run_phase(plan, &phase_config, &handle, &mut events, &mut lines, &cancel).await;
            }
            "3" | "4" => {
                let source = if choice == "3" { "halogen" } else { "solar" };
                println!("Enter sample name: ");
                let Some(sample) = read_line(&mut lines, &cancel).await else {
                    break;
                };
                if sample.is_empty() {
                    println!("Sample name cannot be empty.");
                    continue;
                }
                let plan = PhasePlan::with_setup_note(
                    format!("sample {source} {sample}"),
                    format!("Place sample '{sample}' under the {source} source."),
                );
                run_phase(plan, &phase_config, &handle, &mut events, &mut lines, &cancel).await;
            }
            "5" => handle.dump_gatt().await,
            "6" => {
                println!("Exiting program.");
                break;
            }
            "" => {}
            other => println!("Invalid choice '{other}'. Please try again."),
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    // Unsubscribe and disconnect on every exit path so the instrument is not
    // left in a subscribed/busy state.
    println!("Disconnecting from Opple Light Master Pro …");
    if let Err(e) = handle.disconnect().await {
        error!("disconnect failed: {e:#}");
    } else {
        println!("Disconnected successfully.");
    }
    Ok(())
}
