use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "audix-hub")]
#[command(version)]
#[command(about = "Presence and WebRTC signaling hub for the Audix flat radio", long_about = None)]
pub struct Args {
    /// TCP port (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Static pages directory (overrides AUDIX_WEB_ROOT)
    #[arg(long)]
    pub web_root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}
