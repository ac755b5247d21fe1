use anyhow::Context;
use clap::Parser;
use depscope::common::readable_canonical_path;
use depscope::pe::{demangle_symbol, ImportTarget, PeImage};
use depscope::sxs::{sxs_entries, SxsContext};
use depscope::{get_api_set_schema, get_known_dlls, manifest_text};
use fs_err as fs;
use std::path::PathBuf;

/// Static dependency analysis of Windows PE binaries
#[derive(Parser)]
#[command(name = "depscope", version, about)]
struct Cli {
    /// Target file (.exe or .dll)
    input: Option<PathBuf>,

    /// List the exported symbols
    #[arg(long)]
    exports: bool,

    /// List the imported symbols, grouped by module
    #[arg(long)]
    imports: bool,

    /// Print the embedded manifest
    #[arg(long)]
    manifest: bool,

    /// Resolve the side-by-side assemblies declared in the manifest
    #[arg(long = "sxs-entries")]
    sxs_entries: bool,

    /// List the KnownDlls of the host system
    #[arg(long = "known-dlls")]
    known_dlls: bool,

    /// Dump the ApiSet schema of the host system
    #[arg(long)]
    apisets: bool,

    /// Undecorate C++ symbol names
    #[arg(long)]
    demangle: bool,

    /// Output in JSON format
    #[arg(long)]
    json: bool,

    /// Print what is being resolved against what
    #[arg(short, long)]
    verbose: bool,

    /// Windows partition to use for system tables (default: the partition
    /// where INPUT lies, if it holds a Windows installation)
    #[cfg(not(windows))]
    #[arg(short = 'w', long = "windows-root")]
    windows_root: Option<PathBuf>,
}

impl Cli {
    /// No explicit section flag means "show the usual ones"
    fn wants_default_sections(&self) -> bool {
        !(self.exports
            || self.imports
            || self.manifest
            || self.sxs_entries
            || self.known_dlls
            || self.apisets)
    }
}

fn symbol_for_display(symbol: &str, demangle: bool) -> String {
    if demangle {
        demangle_symbol(symbol).unwrap_or_else(|_| symbol.to_owned())
    } else {
        symbol.to_owned()
    }
}

fn print_exports(image: &PeImage, demangle: bool) {
    println!("[-] Exports ({}):", image.exports().len());
    for export in image.exports() {
        let name = export
            .name
            .as_deref()
            .map(|n| symbol_for_display(n, demangle))
            .unwrap_or_else(|| "(by ordinal)".to_owned());
        match (&export.forwarded_name, export.virtual_address) {
            (Some(target), _) => {
                println!("\t{:5} {} -> forwarded to {}", export.ordinal, name, target)
            }
            (None, Some(rva)) => println!("\t{:5} {} @ 0x{:08x}", export.ordinal, name, rva),
            (None, None) => println!("\t{:5} {}", export.ordinal, name),
        }
    }
}

fn print_imports(image: &PeImage, demangle: bool) {
    println!("[-] Imports ({} modules):", image.imports().len());
    for dll in image.imports() {
        println!("\tImports from {}:", dll.name);
        for import in &dll.imports {
            let delay_tag = if import.delay_load { " (delay-loaded)" } else { "" };
            match &import.target {
                ImportTarget::Name(name) => {
                    println!("\t\t{}{}", symbol_for_display(name, demangle), delay_tag)
                }
                ImportTarget::Ordinal(ord) => println!("\t\tordinal #{}{}", ord, delay_tag),
            }
        }
    }
}

fn print_sxs(image: &PeImage, ctx: &SxsContext) -> anyhow::Result<()> {
    let entries = sxs_entries(image, ctx)?;
    println!("[-] SxS assemblies ({}):", entries.len());
    for entry in &entries {
        let version = entry
            .identity
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!("\t{} {} => {}", entry.identity.name, version, entry.path);
    }
    Ok(())
}

fn print_known_dlls() -> anyhow::Result<()> {
    for (label, wow64) in [("KnownDlls", false), ("KnownDlls32", true)] {
        match get_known_dlls(wow64) {
            Ok(set) => {
                let mut names: Vec<&str> = set.iter().collect();
                names.sort_unstable();
                println!("[-] {} ({}):", label, names.len());
                for name in names {
                    println!("\t{}", name);
                }
            }
            Err(e) => eprintln!("[x] {} unavailable: {}", label, e),
        }
    }
    Ok(())
}

fn print_apisets(json: bool) -> anyhow::Result<()> {
    let schema = get_api_set_schema().context("could not load the ApiSet schema")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&*schema)?);
        return Ok(());
    }
    let mut contracts: Vec<_> = schema.iter().collect();
    contracts.sort_by_key(|(name, _)| name.as_str());
    println!("[-] ApiSet contracts ({}):", contracts.len());
    for (name, hosts) in contracts {
        println!("\t{} => {}", name, hosts.join(", "));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.known_dlls {
        print_known_dlls()?;
    }
    if cli.apisets {
        print_apisets(cli.json)?;
    }

    let Some(input) = &cli.input else {
        if cli.known_dlls || cli.apisets {
            return Ok(());
        }
        anyhow::bail!("no input file given; see --help");
    };

    if !input.exists() {
        eprintln!(
            "Specified file not found at {}\nCurrent working directory: {}",
            input.display(),
            std::env::current_dir()?.display(),
        );
        std::process::exit(1);
    }
    if input.is_dir() {
        eprintln!(
            "The specified path is a directory, not a PE file: {}",
            input.display(),
        );
        std::process::exit(1);
    }

    let input = fs::canonicalize(input)?;
    let image = PeImage::load(&input)?;

    let defaults = cli.wants_default_sections();
    let show_exports = cli.exports || defaults;
    let show_imports = cli.imports || defaults;
    let show_sxs = cli.sxs_entries || defaults;

    if cli.json {
        let ctx = sxs_context(&cli, &image)?;
        let report = serde_json::json!({
            "path": readable_canonical_path(&input)?,
            "machine": image.machine(),
            "internal_name": image.internal_name(),
            "sections": image.sections(),
            "exports": image.exports(),
            "imports": image.imports(),
            "manifest": manifest_text(&image),
            "sxs_entries": sxs_entries(&image, &ctx)?,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("[*] {}", readable_canonical_path(&input)?);
    println!(
        "[-] Machine: {:?}, internal name: {}",
        image.machine(),
        image.internal_name().unwrap_or("-")
    );

    if show_exports {
        print_exports(&image, cli.demangle);
    }
    if show_imports {
        print_imports(&image, cli.demangle);
    }
    if cli.manifest {
        match manifest_text(&image) {
            Some(text) => println!("[-] Manifest:\n{}", text),
            None => println!("[-] No embedded manifest"),
        }
    }
    if show_sxs {
        let ctx = sxs_context(&cli, &image)?;
        if cli.verbose {
            println!(
                "[-] Resolving assemblies against app dir {}, system dir {:?}, WinSxS {:?}",
                ctx.app_dir.display(),
                ctx.sys_dir,
                ctx.winsxs_dir
            );
        }
        print_sxs(&image, &ctx)?;
    }

    Ok(())
}

#[cfg(windows)]
fn sxs_context(_cli: &Cli, image: &PeImage) -> anyhow::Result<SxsContext> {
    Ok(SxsContext::for_image(image)?)
}

#[cfg(not(windows))]
fn sxs_context(cli: &Cli, image: &PeImage) -> anyhow::Result<SxsContext> {
    use depscope::system::WindowsSystem;
    if let Some(root) = &cli.windows_root {
        let system = WindowsSystem::from_root(root).with_context(|| {
            format!("no Windows installation found under {}", root.display())
        })?;
        let app_dir = image
            .path()
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| PathBuf::from("."));
        let winsxs_dir = system.winsxs_dir.clone();
        let mut ctx = SxsContext::for_directories(app_dir, Some(system.sys_dir.clone()), winsxs_dir);
        if let Ok(map) = depscope::parse_apiset(system.sys_dir.join("apisetschema.dll")) {
            ctx = ctx.with_apiset_map(std::sync::Arc::new(map));
        }
        Ok(ctx)
    } else {
        Ok(SxsContext::for_image(image)?)
    }
}
