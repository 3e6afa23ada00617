use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Atelier image generation tool
#[derive(Debug, Parser)]
#[command(name = "atelier", about = "Generate images through a ComfyUI backend")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "atelier.toml", env = "ATELIER_CONFIG")]
    pub config: PathBuf,

    /// Override the backend URL
    #[arg(long, env = "COMFYUI_URL")]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one generation and print the tool output
    Generate(GenerateArgs),
    /// Print the tool's input schema
    Schema,
}

#[derive(Debug, clap::Args)]
pub struct GenerateArgs {
    /// Keywords describing the subject
    #[arg(long)]
    pub prompt: String,

    /// Keywords to exclude from the image
    #[arg(long)]
    pub negative_prompt: String,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// Fixed seed; drawn at random when absent
    #[arg(long)]
    pub seed: Option<u64>,

    /// User the image is stored for
    #[arg(long, default_value = "local")]
    pub user: String,

    /// Shape the output for an agent
    #[arg(long)]
    pub agent: bool,

    /// Persist through the storage collaborator and return its record
    #[arg(long)]
    pub metadata: bool,
}
