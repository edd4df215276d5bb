use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "localci")]
#[command(version)]
#[command(about = "Run CI tasks locally against a checkout", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, value_name = "FILE", global = true, help = "Engine configuration")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the tasks of a task file")]
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "localci-tasks.toml")]
        file: PathBuf,

        #[arg(short, long, help = "Project directory", default_value = ".")]
        project_dir: PathBuf,

        #[arg(long, help = "Run tasks directly in the project directory")]
        dirty: bool,

        #[arg(long, value_name = "DIR", help = "Where uploaded artifacts are written")]
        artifacts_dir: Option<PathBuf>,

        #[arg(long, value_name = "DIR", help = "Where command logs are written")]
        logs_dir: Option<PathBuf>,

        #[arg(short, long, value_name = "KEY=VALUE", help = "Environment overrides")]
        env: Vec<String>,

        #[arg(long, help = "Agent release to use")]
        agent_version: Option<String>,
    },

    #[command(about = "Check a task file without running anything")]
    Validate {
        #[arg(short, long, value_name = "FILE", default_value = "localci-tasks.toml")]
        file: PathBuf,

        #[arg(short, long, help = "Project directory", default_value = ".")]
        project_dir: PathBuf,
    },
}
