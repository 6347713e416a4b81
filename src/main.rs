use std::io::Write;
use std::time::Duration;

use clap::Parser;
use serde_json::json;

use framepipe::cli::{Cli, Command, InspectArgs, RunArgs};
use framepipe::job::DataOptions;
use framepipe::runner::JobRunner;
use framepipe::store::Dataset;
use framepipe::FpResult;

fn main() {
    framepipe::logging::init();
    if let Err(error) = run() {
        eprintln!("error ({}): {error}", error.error_code());
        std::process::exit(1);
    }
}

fn run() -> FpResult<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(&args),
        Command::Inspect(args) => inspect(&args),
    }
}

fn run_pipeline(args: &RunArgs) -> FpResult<()> {
    let job = args.to_job()?;
    let path_out = job.path_out.clone();
    let runner = JobRunner::new(job)?;
    let handle = runner.spawn()?;

    loop {
        let status = handle.status();
        if !args.json {
            eprint!(
                "\r[{:<12}] {:5.1}%  {:8.1} frames/s",
                status.state.to_string(),
                status.progress * 100.0,
                status.rate
            );
            let _ = std::io::stderr().flush();
        }
        if status.state.is_terminal() || handle.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    if !args.json {
        eprintln!();
    }

    handle.join()?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "output": path_out,
                "state": "done",
            }))?
        );
    } else {
        println!("{}", path_out.display());
    }
    Ok(())
}

fn inspect(args: &InspectArgs) -> FpResult<()> {
    let data = Dataset::open(&args.path, &DataOptions::default())?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "attrs": data.attrs(),
                "features": data.feature_names(),
                "records": data.record_names(),
                "basins": data.basin_paths(),
                "len": data.len(),
            }))?
        );
        return Ok(());
    }
    println!("{} ({} records)", args.path.display(), data.len());
    for (key, value) in data.attrs() {
        println!("  {key} = {value}");
    }
    for name in data.feature_names() {
        let local = if data.has_local_feature(&name) {
            "local"
        } else {
            "basin"
        };
        println!("  feature {name} [{local}]");
    }
    for name in data.record_names() {
        println!("  record {name}");
    }
    Ok(())
}
