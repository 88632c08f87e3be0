//! Standalone assembler binary.
//!
//! Compiles a file of embedded-assembler text into a relocatable object,
//! attached either to the begin probe (userspace variant, the default) or to
//! a kprobe (kernel variant).

use std::fs;
use std::path::PathBuf;

use bumpalo::Bump;
use clap::Parser;

use bpfgen::ast::{Probe, ProbeKind, Script, Stmt};
use bpfgen::core::{SessionConfig, SourceLoc, TranslationSession};
use bpfgen::translate_script;

#[derive(Parser)]
#[command(name = "bpfasm", about = "Assemble BPF instruction text into a relocatable object")]
struct Args {
    /// Input assembly file.
    input: PathBuf,

    /// Output object path; defaults to the input with a .bo extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Attach the program to a kprobe on this symbol instead of the begin
    /// probe.
    #[arg(long, value_name = "SYMBOL")]
    kprobe: Option<String>,

    /// Script name recorded in the object.
    #[arg(long)]
    script_name: Option<String>,

    /// Soft errors tolerated before the program hard-exits.
    #[arg(long, default_value_t = 0)]
    max_errors: u64,

    /// LINUX_VERSION_CODE recorded in the version section.
    #[arg(long, default_value_t = 0)]
    kernel_version: u32,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let code = fs::read_to_string(&args.input)?;

    let script_name = args.script_name.clone().unwrap_or_else(|| {
        args.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bpfasm".to_string())
    });
    let arena = Bump::new();
    let session = TranslationSession::with_config(
        &arena,
        SessionConfig {
            script_name,
            max_errors: args.max_errors,
            kernel_version: args.kernel_version,
        },
    );

    let loc = SourceLoc::new(args.input.display().to_string(), 1, 1);
    let kind = match &args.kprobe {
        Some(symbol) => ProbeKind::Kprobe {
            symbol: symbol.clone(),
        },
        None => ProbeKind::Begin,
    };
    let script = Script {
        probes: vec![Probe {
            kind,
            body: Stmt::Embedded {
                code,
                loc: loc.clone(),
            },
            loc,
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script)?;
    let out = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("bo"));
    fs::write(&out, &bytes)?;
    log::info!("wrote {} ({} bytes)", out.display(), bytes.len());
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
