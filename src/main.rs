use std::env;
use std::io::Read;
use std::process::ExitCode;

use relay_config::{Config, Secrets};
use relay_server::Relay;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: relay serve --config <path>\n       relay handle --config <path> --event <file|->";

#[tokio::main]
async fn main() -> ExitCode {
    // stdout is reserved for the `handle` result
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" && cmd != "handle" {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    let mut event_path: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v;
                }
            }
            "--event" => event_path = args.next(),
            other => {
                eprintln!("unknown argument: {other}\n{USAGE}");
                return ExitCode::from(2);
            }
        }
    }

    let cfg = match relay_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::from(2);
        }
    };
    let secrets = Secrets::from_env(&cfg);

    if cmd == "serve" {
        return match relay_server::serve(cfg, secrets).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("server exited with error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let Some(event_path) = event_path else {
        eprintln!("handle requires --event <file|->\n{USAGE}");
        return ExitCode::from(2);
    };
    handle(&cfg, &secrets, &event_path).await
}

/// Runs one invocation; exit 1 asks the caller to redeliver the event.
async fn handle(cfg: &Config, secrets: &Secrets, event_path: &str) -> ExitCode {
    let raw = match read_event(event_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to read event: {e}");
            return ExitCode::from(2);
        }
    };

    let relay = match Relay::init(cfg, secrets).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to initialise relay: {e}");
            return ExitCode::from(2);
        }
    };
    let invocation = relay.invoke(&raw).await;
    println!("{}", invocation.to_json());
    relay.shutdown().await;

    if invocation.redeliver() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn read_event(path: &str) -> std::io::Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(path)
    }
}
