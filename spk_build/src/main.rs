use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use spk_build::pipeline::{build_shader_set, LogSink, TempDirAllocator};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and validate a shader set description into a shader pack.
    Build {
        /// The shader set description file.
        description: PathBuf,
        /// The output shader pack file.
        output: PathBuf,
        /// The path to the glslangValidator executable.
        #[arg(long, default_value = "glslangValidator")]
        glslang: PathBuf,
        /// The directory for intermediate compiled modules.
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let cli = Cli::parse();
    let start = std::time::Instant::now();

    match cli.command {
        Commands::Build {
            description,
            output,
            glslang,
            temp_dir,
        } => {
            let temp_dir = temp_dir.unwrap_or_else(|| std::env::temp_dir().join("spk_build"));
            let mut temp = TempDirAllocator::new(temp_dir);

            match build_shader_set(&description, &glslang, &output, &mut temp, &LogSink) {
                Ok(()) => {
                    println!("Finished in {:?}", start.elapsed());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
