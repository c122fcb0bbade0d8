mod config;

use std::sync::Arc;

use adbrig_core::{
    list_remote_files, AdbConfig, AdbEvent, AdbEvents, AdbRunner, ExecOutcome,
};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "adbrig", version, about = "adb device-management frontend")]
struct Cli {
    /// Device serial; falls back to the configured default, then adb's
    /// only attached device
    #[arg(short = 's', long, global = true)]
    serial: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List attached device serials
    Devices,
    /// Copy a local file onto the device, with progress
    Push { local: String, remote: String },
    /// Copy a device file to the local machine, with progress
    Pull { remote: String, local: String },
    /// Install an APK, replacing an existing install
    Install { apk: String },
    /// Remove a path on the device
    Rm { path: String },
    /// Map a local TCP port to a device abstract socket
    Forward { local_port: u16, socket_name: String },
    /// Remove a forward mapping
    ForwardRemove { local_port: u16 },
    /// Map a device abstract socket back to a local TCP port
    Reverse { socket_name: String, local_port: u16 },
    /// Remove a reverse mapping
    ReverseRemove { socket_name: String },
    /// Run a shell command on the device
    Shell { args: Vec<String> },
    /// List a device directory (blocking, bounded by a timeout)
    Ls { path: String },
    /// Print the device's WLAN address
    Ip,
    /// Toggle the show-touches developer setting
    ShowTouches { enabled: bool },
    /// Persist a default adb path or device serial
    SetConfig {
        #[arg(long)]
        adb_path: Option<String>,
        #[arg(long)]
        default_serial: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    adbrig_util::init_tracing()?;
    adbrig_telemetry::init_with_env("adbrig", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let persisted = config::load();

    if let Cmd::SetConfig {
        adb_path,
        default_serial,
    } = &cli.cmd
    {
        let mut updated = persisted;
        if adb_path.is_some() {
            updated.adb_path = adb_path.clone();
        }
        if default_serial.is_some() {
            updated.default_serial = default_serial.clone();
        }
        config::save(&updated)?;
        println!("configuration saved");
        return Ok(());
    }

    let serial = cli
        .serial
        .or_else(|| persisted.default_serial.clone())
        .unwrap_or_default();
    let app_default = persisted
        .adb_path
        .as_deref()
        .map(adbrig_util::expand_user);
    let adb_config = Arc::new(AdbConfig::resolve(app_default.as_deref()));

    match cli.cmd {
        Cmd::Devices => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.devices().await?;
            let outcome = wait_outcome(&mut events, false).await;
            if outcome != ExecOutcome::Succeeded {
                eprint!("{}", runner.stderr());
            }
            finish("devices", outcome);
            for serial in runner.device_serials() {
                println!("{serial}");
            }
        }
        Cmd::Push { local, remote } => {
            let local = adbrig_util::expand_user(&local);
            let (runner, events) = AdbRunner::new(Arc::clone(&adb_config));
            runner
                .push(&serial, &local.to_string_lossy(), &remote)
                .await?;
            let outcome = watch_transfer(events).await;
            if outcome != ExecOutcome::Succeeded {
                eprint!("{}", runner.stderr());
            }
            finish("push", outcome);
        }
        Cmd::Pull { remote, local } => {
            let local = adbrig_util::expand_user(&local);
            let (runner, events) = AdbRunner::new(Arc::clone(&adb_config));
            runner
                .pull(&serial, &remote, &local.to_string_lossy())
                .await?;
            let outcome = watch_transfer(events).await;
            if outcome != ExecOutcome::Succeeded {
                eprint!("{}", runner.stderr());
            }
            finish("pull", outcome);
        }
        Cmd::Install { apk } => {
            let apk = adbrig_util::expand_user(&apk);
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.install(&serial, &apk.to_string_lossy()).await?;
            finish("install", wait_outcome(&mut events, true).await);
        }
        Cmd::Rm { path } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.remove_path(&serial, &path).await?;
            finish("rm", wait_outcome(&mut events, true).await);
        }
        Cmd::Forward {
            local_port,
            socket_name,
        } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.forward(&serial, local_port, &socket_name).await?;
            finish("forward", wait_outcome(&mut events, true).await);
        }
        Cmd::ForwardRemove { local_port } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.forward_remove(&serial, local_port).await?;
            finish("forward-remove", wait_outcome(&mut events, true).await);
        }
        Cmd::Reverse {
            socket_name,
            local_port,
        } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.reverse(&serial, &socket_name, local_port).await?;
            finish("reverse", wait_outcome(&mut events, true).await);
        }
        Cmd::ReverseRemove { socket_name } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.reverse_remove(&serial, &socket_name).await?;
            finish("reverse-remove", wait_outcome(&mut events, true).await);
        }
        Cmd::Shell { args } => {
            let parts: Vec<&str> = args.iter().map(String::as_str).collect();
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.shell(&serial, &parts).await?;
            finish("shell", wait_outcome(&mut events, true).await);
        }
        Cmd::Ls { path } => {
            for entry in list_remote_files(&adb_config, &serial, &path).await {
                println!("{entry}");
            }
            adbrig_telemetry::event("cli.exec", &[("command", "ls"), ("outcome", "ok")]);
        }
        Cmd::Ip => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.shell(&serial, &["ifconfig", "wlan0"]).await?;
            let _ = wait_outcome(&mut events, false).await;
            let mut ip = runner.device_ip_from_ifconfig();

            if ip.is_none() {
                // Newer Android builds ship `ip` but not `ifconfig`.
                runner
                    .shell(&serial, &["ip", "-f", "inet", "addr", "show", "wlan0"])
                    .await?;
                let _ = wait_outcome(&mut events, false).await;
                ip = runner.device_ip_from_ip_cmd();
            }

            match ip {
                Some(ip) => {
                    adbrig_telemetry::event("cli.exec", &[("command", "ip"), ("outcome", "ok")]);
                    println!("{ip}");
                }
                None => {
                    eprintln!("no wlan address found");
                    std::process::exit(1);
                }
            }
        }
        Cmd::ShowTouches { enabled } => {
            let (runner, mut events) = AdbRunner::new(Arc::clone(&adb_config));
            runner.set_show_touches(&serial, enabled).await?;
            finish("show-touches", wait_outcome(&mut events, true).await);
        }
        Cmd::SetConfig { .. } => unreachable!("handled before adb resolution"),
    }

    Ok(())
}

async fn wait_outcome(events: &mut AdbEvents, echo: bool) -> ExecOutcome {
    while let Some(event) = events.recv().await {
        match event {
            AdbEvent::Started | AdbEvent::Progress { .. } => {}
            AdbEvent::Log(line) => {
                if echo {
                    print_log(&line);
                }
            }
            AdbEvent::Terminal(outcome) => return outcome,
        }
    }
    ExecOutcome::ExitedWithError
}

async fn watch_transfer(events: AdbEvents) -> ExecOutcome {
    let mut stream = events.into_stream();
    while let Some(event) = stream.next().await {
        match event {
            AdbEvent::Progress { download, percent } => {
                println!("{} {percent}%", if download { "pull" } else { "push" });
            }
            AdbEvent::Started | AdbEvent::Log(_) => {}
            AdbEvent::Terminal(outcome) => return outcome,
        }
    }
    ExecOutcome::ExitedWithError
}

fn print_log(line: &str) {
    if line.ends_with('\n') {
        print!("{line}");
    } else {
        println!("{line}");
    }
}

fn finish(name: &str, outcome: ExecOutcome) {
    adbrig_telemetry::event(
        "cli.exec",
        &[("command", name), ("outcome", outcome_label(outcome))],
    );
    if outcome != ExecOutcome::Succeeded {
        match outcome {
            ExecOutcome::MissingBinary => eprintln!(
                "adb not found (set ADBRIG_ADB_PATH or `adbrig set-config --adb-path <path>`)"
            ),
            ExecOutcome::StartFailed => eprintln!("adb failed to start"),
            _ => eprintln!("adb command failed"),
        }
        std::process::exit(1);
    }
}

fn outcome_label(outcome: ExecOutcome) -> &'static str {
    match outcome {
        ExecOutcome::Succeeded => "ok",
        ExecOutcome::ExitedWithError => "exit-error",
        ExecOutcome::StartFailed => "start-failed",
        ExecOutcome::MissingBinary => "missing-binary",
    }
}
