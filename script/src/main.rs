use std::{collections::HashMap, path::PathBuf};

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scriptcc::{
    backend::text::{FLAG_DEBUG_INFO, FLAG_NO_DCE},
    object::Image,
    CacheLocation, Flags, FuncInfo, RelocModel, Script,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a module and print what it exports.
    Build {
        source: PathBuf,
        #[arg(long)]
        library: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Kind::Executable)]
        kind: Kind,
        #[arg(long, value_enum, default_value_t = Reloc::Default)]
        reloc: Reloc,
        /// Keep unreachable definitions.
        #[arg(long)]
        no_dce: bool,
        #[arg(long)]
        debug_info: bool,
        /// Keep and export this symbol even if nothing uses it.
        #[arg(long = "keep")]
        keep: Vec<String>,
        /// Address for an imported symbol, as NAME=ADDR.
        #[arg(long = "symbol", value_parser = parse_symbol)]
        symbols: Vec<(String, usize)>,
        /// Where to write the shared object.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Link this relocatable object instead of compiling sources.
        #[arg(long)]
        object: Option<PathBuf>,
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Print the header of a compiled object.
    Inspect { object: PathBuf },
}

#[derive(ClapArgs, Debug)]
struct CacheArgs {
    #[arg(long, env = "SCRIPTCC_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Base name of the cache entry; defaults to the source file stem.
    #[arg(long)]
    cache_name: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Relocatable,
    Shared,
    Executable,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Reloc {
    Default,
    Static,
    Pic,
    DynamicNoPic,
}

impl From<Reloc> for RelocModel {
    fn from(value: Reloc) -> Self {
        match value {
            Reloc::Default => RelocModel::Default,
            Reloc::Static => RelocModel::Static,
            Reloc::Pic => RelocModel::Pic,
            Reloc::DynamicNoPic => RelocModel::DynamicNoPic,
        }
    }
}

fn parse_symbol(s: &str) -> Result<(String, usize), String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDR, got {s:?}"))?;
    let addr = match addr.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => addr.parse(),
    }
    .map_err(|e| format!("bad address {addr:?}: {e}"))?;
    Ok((name.to_owned(), addr))
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptcc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct BuildOptions {
    source: PathBuf,
    library: Option<PathBuf>,
    kind: Kind,
    reloc: Reloc,
    flags: Flags,
    keep: Vec<String>,
    symbols: Vec<(String, usize)>,
    output: Option<PathBuf>,
    object: Option<PathBuf>,
    cache: Option<CacheLocation>,
}

fn build(opts: BuildOptions) -> anyhow::Result<()> {
    let mut script = Script::new();
    script
        .add_source_file(0, &opts.source, Flags::NONE)
        .with_context(|| format!("registering {}", opts.source.display()))?;
    if let Some(library) = &opts.library {
        script
            .add_source_file(1, library, Flags::NONE)
            .with_context(|| format!("registering {}", library.display()))?;
    }
    for name in opts.keep {
        script.mark_external_symbol(name);
    }
    let symbols: HashMap<String, usize> = opts.symbols.into_iter().collect();
    script.register_symbol_callback(move |name| symbols.get(name).copied());

    let cache = opts.cache.as_ref();
    let prepared = match opts.kind {
        Kind::Relocatable => script.prepare_relocatable(cache, opts.reloc.into(), opts.flags),
        Kind::Executable => script.prepare_executable(cache, opts.flags),
        Kind::Shared => {
            let Some(output) = &opts.output else {
                bail!("--output is required for shared objects");
            };
            script.prepare_shared_object(cache, opts.object.as_deref(), output, opts.flags)
        }
    };
    if let Err(e) = prepared {
        if let Some(message) = script.compiler_error_message() {
            eprintln!("{message}");
        }
        return Err(e).context("preparing script");
    }

    println!("status: {:?}", script.status());
    println!("kind: {:?}", script.object_kind());
    println!("size: {}", script.elf_size());
    if let Some(location) = script.cache_location() {
        println!("cache: {}/{}", location.dir.display(), location.name);
    }

    let mut names = vec![];
    script.export_var_name_list(&mut names);
    println!("vars: {}", names.iter().join(", "));
    names.clear();
    script.export_func_name_list(&mut names);
    println!("funcs: {}", names.iter().join(", "));
    names.clear();
    script.export_for_each_name_list(&mut names);
    println!("foreach: {}", names.iter().join(", "));

    let mut infos = vec![FuncInfo::default(); script.func_count()];
    script.func_info_list(&mut infos);
    for info in infos {
        println!("  {:#x} {:>6} {}", info.address, info.size, info.name);
    }

    let count = script.pragma_count();
    let mut keys = vec![""; count];
    let mut values = vec![""; count];
    script.pragma_list(&mut keys, &mut values);
    for (k, v) in keys.iter().zip(&values) {
        println!("pragma {k} = {v}");
    }
    Ok(())
}

fn inspect(object: PathBuf) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(&object).with_context(|| format!("reading {}", object.display()))?;
    let image = Image::decode(&bytes).with_context(|| format!("decoding {}", object.display()))?;
    let header = &image.header;
    println!("kind: {:?} ({:?})", header.kind, header.reloc_model);
    for section in &header.sections {
        println!(
            "section {:<8} {:#06x} {:>6}",
            section.name, section.offset, section.size
        );
    }
    for symbol in header.symbols.iter() {
        println!(
            "symbol {:<8} {:#06x} {:>6} {}",
            format!("{:?}", symbol.kind),
            symbol.offset,
            symbol.size,
            symbol.name
        );
    }
    if !header.imports.is_empty() {
        println!("imports: {}", header.imports.iter().join(", "));
    }
    for reloc in &header.relocations {
        println!("reloc {:#06x} -> {}", reloc.offset, reloc.target);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Commands::Build {
            source,
            library,
            kind,
            reloc,
            no_dce,
            debug_info,
            keep,
            symbols,
            output,
            object,
            cache,
        } => {
            let mut flags = Flags::NONE;
            if no_dce {
                flags = flags | FLAG_NO_DCE;
            }
            if debug_info {
                flags = flags | FLAG_DEBUG_INFO;
            }
            let cache = cache.cache_dir.map(|dir| {
                let name = cache.cache_name.unwrap_or_else(|| {
                    source
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "script".to_owned())
                });
                CacheLocation::new(dir, name)
            });
            build(BuildOptions {
                source,
                library,
                kind,
                reloc,
                flags,
                keep,
                symbols,
                output,
                object,
                cache,
            })
        }
        Commands::Inspect { object } => inspect(object),
    }
}
