// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Command-line front end for the builtin module bridge
//!
//! Translates module names, lists the builtin DLL search path, resolves and
//! opens libraries, and synthesizes an image for the running binary itself.

#![cfg(unix)]

use anyhow::{Context, Result, anyhow, bail};
use builtin_platform_host::{DlLoader, builtin_registry};
use builtin_shim::image::layout::DIRECTORY_IMPORT;
use builtin_shim::image::{
    ExportTables, ImportBlock, ResourceDataEntry, ResourceDirectory, ResourceName,
};
use builtin_shim::{BridgeConfig, HostLoader, ModuleTemplate, NameResolver, SyntheticImage};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

/// Inspect and exercise the builtin module bridge
#[derive(Parser, Debug)]
#[command(name = "builtin_runner", long_about = None)]
pub struct CliArgs {
    /// Log bridge activity to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Translate Windows module names to native library names
    NativeName {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List the builtin DLL search path
    SearchPath,

    /// List the candidate paths for a module
    Resolve {
        /// Windows module name, or a native name with --native
        name: String,

        /// Treat NAME as an already translated native name
        #[arg(long, conflicts_with = "open")]
        native: bool,

        /// Open the module with the host loader
        #[arg(long)]
        open: bool,
    },

    /// Synthesize an image describing this binary and print it
    InspectSelf {
        /// Map the header page at this address (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_address)]
        preferred_base: Option<usize>,

        /// Describe the binary as a main executable instead of a library
        #[arg(long)]
        main_executable: bool,
    },
}

fn parse_address(value: &str) -> core::result::Result<usize, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid address {value:?}: {err}"))
}

/// Run one command, writing its report to `out`
pub fn run(args: &CliArgs, out: &mut dyn Write) -> Result<()> {
    let config = BridgeConfig::from_env();
    match &args.command {
        Command::NativeName { names } => {
            let resolver = NameResolver::new(&config);
            for name in names {
                writeln!(out, "{name} -> {}", resolver.native_name(name))?;
            }
        }
        Command::SearchPath => {
            let resolver = NameResolver::new(&config);
            let path = resolver.search_path();
            if path.is_empty() {
                writeln!(out, "{} is empty", config.search_path_var)?;
            }
            for (index, dir) in path.iter().enumerate() {
                writeln!(out, "{index}: {}", dir.display())?;
            }
        }
        Command::Resolve { name, native, open } => resolve(&config, name, *native, *open, out)?,
        Command::InspectSelf {
            preferred_base,
            main_executable,
        } => inspect_self(*preferred_base, *main_executable, out)?,
    }
    Ok(())
}

fn resolve(config: &BridgeConfig, name: &str, native: bool, open: bool, out: &mut dyn Write) -> Result<()> {
    let resolver = NameResolver::new(config);
    let file = if native {
        name.to_string()
    } else {
        resolver.native_name(name)
    };
    writeln!(out, "{name} -> {file}")?;

    let candidates = (0..).map_while(|index| resolver.path_at(name, index, native));
    for (index, path) in candidates.enumerate() {
        writeln!(out, "  [{index}] {}", path.display())?;
    }
    writeln!(out, "  [*] {file}")?;

    if open {
        let handle = resolver
            .open(name, &DlLoader)
            .with_context(|| format!("Failed to open {name}"))?;
        writeln!(out, "opened {name}: handle {:#x}", handle.as_raw())?;
        DlLoader.close(handle);
    }
    Ok(())
}

static VERSION: [u8; 16] = *b"builtin_runner\0\0";
static SELF_TEMPLATE: OnceLock<ModuleTemplate> = OnceLock::new();

/// Template describing this binary
fn build_self_template(preferred_base: Option<usize>, main_executable: bool) -> Result<ModuleTemplate> {
    let run_address = run as *const () as usize;
    let render_address = render_image as *const () as usize;
    let imports: &'static [usize] =
        Box::leak(vec![run_address, 0, render_address, 0, 0].into_boxed_slice());
    let exports = ExportTables::new(
        c"builtin_runner",
        1,
        &[run_address, render_address],
        &[c"render_image", c"run"],
        &[1, 0],
    )?;
    let resources = ResourceDirectory::new().with_directory(
        ResourceName::Id(16),
        ResourceDirectory::new().with_directory(
            ResourceName::Id(1),
            ResourceDirectory::new()
                .with_data(ResourceName::Id(0x409), ResourceDataEntry::new(&VERSION)?),
        ),
    );

    let template = if main_executable {
        ModuleTemplate::main_executable()
    } else {
        ModuleTemplate::library()
    };
    Ok(template
        .with_preferred_base(preferred_base.unwrap_or(0))
        .with_entry_point(run_address)
        .with_imports(ImportBlock::from_slots(imports))
        .with_resources(resources)
        .with_exports(exports))
}

fn inspect_self(preferred_base: Option<usize>, main_executable: bool, out: &mut dyn Write) -> Result<()> {
    let template = build_self_template(preferred_base, main_executable)?;
    // Kept in a static so the template lives inside this binary's data.
    let template = SELF_TEMPLATE.get_or_init(|| template);

    let delivered: Arc<Mutex<Vec<(Option<SyntheticImage>, String)>>> = Arc::default();
    let sink = Arc::clone(&delivered);
    let filename = if main_executable { "builtin_runner.exe" } else { "builtin_runner.dll" };
    {
        let mut registry = builtin_registry();
        registry.register(template, filename)?;
        registry.install_callback(move |image, name| {
            if let Ok(mut sink) = sink.lock() {
                sink.push((image, name.to_string()));
            }
        });
    }

    let delivered = delivered
        .lock()
        .map_err(|_| anyhow!("delivery list poisoned"))?;
    let Some((image, name)) = delivered.first() else {
        bail!("nothing was delivered");
    };
    let Some(image) = image else {
        bail!("Failed to synthesize an image for {filename} (see log with --verbose)");
    };
    writeln!(out, "delivered {name:?}")?;
    render_image(image, out)
}

/// Print the headers and directories of a synthesized image
pub fn render_image(image: &SyntheticImage, out: &mut dyn Write) -> Result<()> {
    let nt = image.nt_headers();
    writeln!(out, "image base       {:#x}", image.base())?;
    writeln!(out, "machine          {:#06x}", nt.file_header.machine)?;
    writeln!(out, "characteristics  {:#06x}", nt.file_header.characteristics)?;
    writeln!(out, "subsystem        {}", nt.optional_header.subsystem)?;
    writeln!(out, "size of image    {:#x}", nt.optional_header.size_of_image)?;
    match image.entry_point() {
        Some(entry) => writeln!(
            out,
            "entry point      {entry:#x} (rva {:#x})",
            nt.optional_header.address_of_entry_point
        )?,
        None => writeln!(out, "entry point      none")?,
    }

    for section in image.sections() {
        writeln!(
            out,
            "{:<8} rva {:#x} size {:#x} flags {:#010x}",
            section.name(),
            section.virtual_address,
            section.virtual_size,
            section.characteristics
        )?;
    }

    let imports = image.directory(DIRECTORY_IMPORT);
    let live = image.import_slots().iter().filter(|&&slot| slot != 0).count();
    writeln!(
        out,
        "imports          {} slots ({live} non-null), {} bytes",
        image.import_slots().len(),
        imports.size
    )?;

    if let Some(resources) = image.resources() {
        writeln!(
            out,
            "resources        {} directories, {} leaves",
            resources.directory_count(),
            resources.leaves().len()
        )?;
    }

    if let Some(exports) = image.exports() {
        let module = exports
            .module_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(
            out,
            "exports          {module}: {} functions, {} names",
            exports.functions().len(),
            exports.names().len()
        )?;
        for index in 0..exports.names().len() {
            let Some(name) = exports.name(index) else {
                continue;
            };
            let name = name.to_string_lossy();
            match exports.lookup(&name) {
                Some(address) => writeln!(out, "  {name} -> {address:#x}")?,
                None => writeln!(out, "  {name} -> unresolved")?,
            }
        }
    }
    Ok(())
}
