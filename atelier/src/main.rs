#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use args::{Args, Command, GenerateArgs};
use atelier_config::Config;
use atelier_imagegen::{CallContext, ComfyUiTool, ToolInput, ToolOutput};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing file means defaults plus environment
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };

    if let Some(url) = args.url {
        config.comfyui.url = Some(url);
    }
    if matches!(args.command, Command::Schema) {
        config.comfyui.allow_missing_url = true;
    }

    atelier_telemetry::init(&config.telemetry, "info")?;

    tracing::debug!(config_path = %args.config.display(), "starting atelier");

    let tool = atelier_imagegen::build_tool(&config)?;

    match args.command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&tool.schema())?);
        }
        Command::Generate(generate) => {
            let output = run(&tool, generate).await;
            print_output(output)?;
        }
    }

    Ok(())
}

async fn run(tool: &ComfyUiTool, args: GenerateArgs) -> ToolOutput {
    let input = ToolInput {
        width: args.width,
        height: args.height,
        seed: args.seed,
        ..ToolInput::new(args.prompt, args.negative_prompt)
    };

    let mut context = if args.agent {
        CallContext::agent(args.user)
    } else {
        CallContext::direct(args.user)
    };
    if args.metadata {
        context = context.with_metadata();
    }

    tool.call(input, &context).await
}

fn print_output(output: ToolOutput) -> anyhow::Result<()> {
    if let Some(text) = output.as_str() {
        println!("{text}");
    } else {
        println!("{}", serde_json::to_string_pretty(&output.into_value())?);
    }

    Ok(())
}
