//=====================================================
// File: main.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Strata CLI entry point
// Objective: Run, check, compile and disassemble Strata programs, and dump
//            the token stream or AST of a source file
//=====================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata::bytecode::{CompiledProgram, disassemble};
use strata::config::{OptimizerConfig, StrataConfig};
use strata::tokenizer::{SyntaxLevel, tokenize};
use strata::vm::VmError;
use strata::{Pipeline, PipelineError};

/// Exit status for an uncaught runtime exception.
const EXIT_FATAL: u8 = 70;

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Strata multi-level compiler and VM")]
pub struct Args {
    /// Log at debug level unless STRATA_LOG says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile and execute a source file.
    Run(RunArgs),
    /// Parse and type check without generating code.
    Check(SourceArgs),
    /// Compile a source file into .stbc bytecode.
    Compile(CompileArgs),
    /// Print the bytecode of a source or .stbc file.
    Disasm(DisasmArgs),
    /// Print the token stream.
    Tokens(SourceArgs),
    /// Print the parsed AST.
    Ast(SourceArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SourceArgs {
    pub input: PathBuf,

    /// Syntax level in effect before the first marker.
    #[arg(long, value_parser = parse_level, default_value = "medium")]
    pub level: SyntaxLevel,

    /// Configuration file; defaults to strata.toml next to the input.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Skip both optimizers.
    #[arg(long = "no-opt")]
    pub no_opt: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print execution statistics after the run.
    #[arg(long)]
    pub profile: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CompileArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output .stbc bytecode file.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DisasmArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Emit the compiled program as JSON instead of a listing.
    #[arg(long)]
    pub json: bool,
}

fn parse_level(text: &str) -> Result<SyntaxLevel, String> {
    SyntaxLevel::from_marker(text.trim_start_matches('@'))
        .ok_or_else(|| format!("unknown level '{text}' (expected high, medium, low or assembly)"))
}

fn install_tracing(verbose: bool) {
    let default = if verbose { "strata=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    install_tracing(args.verbose);

    match dispatch(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Vm(VmError::Fatal(fatal))) => {
                eprint!("{}", fatal.report());
                ExitCode::from(EXIT_FATAL)
            }
            Some(PipelineError::Diagnostics(diagnostics)) => {
                eprint!("{diagnostics}");
                ExitCode::FAILURE
            }
            _ => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run(cmd) => run_source(&cmd),
        Command::Check(cmd) => check_source(&cmd),
        Command::Compile(cmd) => compile_to_file(&cmd),
        Command::Disasm(cmd) => disasm(&cmd),
        Command::Tokens(cmd) => print_tokens(&cmd),
        Command::Ast(cmd) => print_ast(&cmd),
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn pipeline_for(args: &SourceArgs) -> Result<Pipeline> {
    let mut config = match &args.config {
        Some(path) => StrataConfig::load(path)?,
        None => StrataConfig::discover(&args.input)?,
    };
    if args.no_opt {
        config.optimizer = OptimizerConfig::disabled();
    }
    Ok(Pipeline::new(config).with_level(args.level))
}

fn run_source(args: &RunArgs) -> Result<()> {
    let source = read_source(&args.source.input)?;
    let pipeline = pipeline_for(&args.source)?;
    let mut vm = pipeline.load(&source)?;
    let result = vm.run().map_err(PipelineError::from)?;
    info!(result = %vm.render(&result), "program finished");
    if args.profile {
        let profile = vm.profile();
        eprintln!(
            "steps: {} | collections: {} | freed: {} | time: {:?}",
            profile.steps,
            profile.collections,
            profile.objects_freed,
            profile.total_duration.unwrap_or_default()
        );
        for (name, calls) in profile.hot_functions.ranked().into_iter().take(10) {
            eprintln!("  {calls:>8}  {name}");
        }
    }
    Ok(())
}

fn check_source(args: &SourceArgs) -> Result<()> {
    let source = read_source(&args.input)?;
    let checked = pipeline_for(args)?.check(&source)?;
    eprint!("{}", checked.warnings);
    println!(
        "{}: ok ({} statements)",
        args.input.display(),
        checked.typed.program.statements.len()
    );
    Ok(())
}

fn compile_to_file(args: &CompileArgs) -> Result<()> {
    let source = read_source(&args.source.input)?;
    let program = pipeline_for(&args.source)?.compile(&source)?;
    program
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!(
        "wrote {} ({} functions, {} words)",
        args.output.display(),
        program.functions.len(),
        program.code.len()
    );
    Ok(())
}

fn load_program(args: &SourceArgs) -> Result<CompiledProgram> {
    let is_bytecode = args.input.extension().is_some_and(|ext| ext == "stbc");
    if is_bytecode {
        return CompiledProgram::load(&args.input)
            .with_context(|| format!("failed to load {}", args.input.display()));
    }
    let source = read_source(&args.input)?;
    Ok(pipeline_for(args)?.compile(&source)?)
}

fn disasm(args: &DisasmArgs) -> Result<()> {
    let program = load_program(&args.source)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&program)?);
    } else {
        print!("{}", disassemble(&program)?);
    }
    Ok(())
}

fn print_tokens(args: &SourceArgs) -> Result<()> {
    let source = read_source(&args.input)?;
    for token in tokenize(&source) {
        println!(
            "{:>4}:{:<3} {:?} {:?}",
            token.position.line, token.position.column, token.kind, token.lexeme
        );
    }
    Ok(())
}

fn print_ast(args: &SourceArgs) -> Result<()> {
    let source = read_source(&args.input)?;
    let parsed = pipeline_for(args)?.parse(&source);
    println!("{:#?}", parsed.program);
    if parsed.diagnostics.has_errors() {
        eprint!("{}", parsed.diagnostics);
        return Err(anyhow!("{} syntax error(s)", parsed.diagnostics.error_count()));
    }
    Ok(())
}
