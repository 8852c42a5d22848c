use anyhow::{bail, Result};
use options::{Command, ConvertOptions, LogFormat};
use serde::Serialize;
use speedlink::domain::AlertPolicy;
use speedlink::module::pipeline;
use structopt::StructOpt;
use tracing::info;

mod options;

#[derive(Debug, Serialize)]
struct Conversion {
    rpm: i32,
    speed_kmh: f32,
    alert: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (command, json) = init();

    match command {
        Command::Pipeline(options) => {
            let summary = pipeline::run(options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in summary.relay.iter() {
                    match (&report.error, report.speed_kmh) {
                        (None, Some(speed_kmh)) => println!(
                            "cycle {}: {} rpm -> {:.2} km/h (acknowledged)",
                            report.cycle,
                            report.rpm.unwrap_or_default(),
                            speed_kmh
                        ),
                        (Some(error), _) => println!("cycle {}: failed, {}", report.cycle, error),
                        (None, None) => println!("cycle {}: no measurement", report.cycle),
                    }
                }

                println!("alerts broadcast: {}", summary.broadcasts.len());
            }

            if !summary.is_success() {
                bail!("not every relay cycle has been acknowledged");
            }
        }
        Command::Convert(options) => convert(options, json)?,
    }

    Ok(())
}

fn convert(options: ConvertOptions, json: bool) -> Result<()> {
    let vehicle = options.vehicle.parameters()?;
    let policy = AlertPolicy {
        threshold_kmh: options.threshold,
    };

    let speed_kmh = vehicle.convert(options.rpm);
    let conversion = Conversion {
        rpm: options.rpm,
        speed_kmh,
        alert: policy.should_alert(speed_kmh),
    };

    if json {
        println!("{}", serde_json::to_string(&conversion)?);
    } else {
        println!(
            "{} rpm -> {:.2} km/h{}",
            conversion.rpm,
            conversion.speed_kmh,
            if conversion.alert { " (alert)" } else { "" }
        );
    }

    Ok(())
}

fn init() -> (Command, bool) {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(options.log)
        .with_writer(std::io::stderr);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("speedlink {}", env!("CARGO_PKG_VERSION"));

    (options.command, options.json)
}
