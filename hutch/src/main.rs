#![forbid(unsafe_code)]

//! Command-line driver: resolve modules on disk, run inference over their
//! sample inputs, freeze the registry, lower to C and print the program.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use miette::{IntoDiagnostic, NamedSource};

use hutch_backend_c::{RUNTIME_HEADER, lower};
use hutch_infer::{InferError, ModuleInput, ModuleSource, Session};

#[derive(Parser, Debug)]
#[command(name = "hutch", version, about = "Sample-driven compiler from .hut modules to C")]
struct Cli {
    /// Entry module source file (name must end in the source extension)
    path: PathBuf,

    /// Source file extension
    #[arg(long, default_value = ".hut")]
    extension: String,

    /// Splice this file in place of the embedded runtime header
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Directory of per-module sample inputs, looked up next to each module
    #[arg(long, default_value = "samples.hut")]
    samples: String,

    /// Also write a standalone entry point to this file
    #[arg(long)]
    main: Option<PathBuf>,

    /// Write declarations to this header and `#include` it in the program
    #[arg(long)]
    header: Option<PathBuf>,
}

/// Filesystem module resolution: dots in a module name map to path
/// separators under the entry module's directory.
struct FsModuleSource {
    base: PathBuf,
    extension: String,
    samples: String,
}

impl FsModuleSource {
    /// Sample input lives in the samples directory next to the module file,
    /// under the full dotted module name. Missing samples read as empty.
    fn sample_for(&self, module_path: &Path, name: &str) -> String {
        let dir = module_path.parent().unwrap_or(Path::new(""));
        fs::read_to_string(dir.join(&self.samples).join(name)).unwrap_or_default()
    }
}

impl ModuleSource for FsModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInput, InferError> {
        let path = module_file(&self.base, name, &self.extension);
        let src = fs::read_to_string(&path).map_err(|e| InferError::Import {
            module: name.to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        let phrases = hutch_parse::scan_text(&src).map_err(|e| {
            let report = miette::Report::new(e)
                .with_source_code(NamedSource::new(path.display().to_string(), src.clone()));
            InferError::Import {
                module: name.to_string(),
                message: format!("{report:?}"),
            }
        })?;
        let sample = self.sample_for(&path, name);
        Ok(ModuleInput { phrases, sample })
    }
}

fn module_file(base: &Path, name: &str, extension: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in name.split('.') {
        path.push(part);
    }
    let mut file = OsString::from(path);
    file.push(extension);
    PathBuf::from(file)
}

fn split_entry(path: &Path, extension: &str) -> miette::Result<(PathBuf, String)> {
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| miette::miette!("not a source file: {}", path.display()))?;
    let name = file.strip_suffix(extension).filter(|n| !n.is_empty());
    let name = name.ok_or_else(|| {
        miette::miette!("`{}` does not end in `{extension}`", path.display())
    })?;
    let base = path.parent().unwrap_or(Path::new("")).to_path_buf();
    Ok((base, name.to_string()))
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let (base, entry) = split_entry(&cli.path, &cli.extension)?;

    let source = FsModuleSource {
        base,
        extension: cli.extension.clone(),
        samples: cli.samples.clone(),
    };
    let mut session = Session::new();
    session.infer(&source, &entry)?;
    session.freeze();
    let artifacts = lower(&session)?;

    let runtime = match &cli.runtime {
        Some(path) => fs::read_to_string(path).into_diagnostic()?,
        None => RUNTIME_HEADER.to_string(),
    };

    // assemble the full program before writing anything, so stdout never
    // carries partial output
    let mut program = String::new();
    program.push_str(&runtime);
    program.push('\n');
    match &cli.header {
        Some(path) => program.push_str(&format!("#include \"{}\"\n\n", path.display())),
        None => {
            program.push_str(&artifacts.declarations);
            program.push('\n');
        }
    }
    program.push_str(&artifacts.program);

    if let Some(path) = &cli.header {
        fs::write(path, format!("#pragma once\n\n{}", artifacts.declarations))
            .into_diagnostic()?;
    }
    if let Some(path) = &cli.main {
        fs::write(path, &artifacts.main).into_diagnostic()?;
    }

    print!("{program}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_splits_into_base_and_module() {
        let (base, name) = split_entry(Path::new("demo/app.hut"), ".hut").expect("split");
        assert_eq!(base, PathBuf::from("demo"));
        assert_eq!(name, "app");
    }

    #[test]
    fn wrong_extension_is_rejected() {
        assert!(split_entry(Path::new("demo/app.py"), ".hut").is_err());
        assert!(split_entry(Path::new("demo/.hut"), ".hut").is_err());
    }

    #[test]
    fn dotted_module_names_map_to_nested_paths() {
        let path = module_file(Path::new("demo"), "geo.point", ".hut");
        assert_eq!(path, PathBuf::from("demo/geo/point.hut"));
    }
}
