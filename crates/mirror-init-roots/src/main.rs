// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Scans a service's YAML configuration for path-slicing object storages
//! and prints their root directories; with `--init`, missing roots are
//! created. Meant to run as a container entrypoint step, where a missing
//! root would otherwise surface as an obscure storage error much later.

use std::{env, fs, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use serde_yaml::Value;
use tracing::info;

/// Root-initialization options.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Ensure path-slicing objstorage roots exist",
    rename_all = "kebab-case"
)]
struct Opts {
    /// The configuration file to scan. Defaults to the file named by the
    /// MIRROR_CONFIG_FILENAME environment variable.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Create the missing root directories instead of only listing them.
    #[arg(long)]
    init: bool,
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt::try_init();
    let opts = Opts::parse();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: &Opts) -> anyhow::Result<()> {
    let path = opts
        .config
        .clone()
        .or_else(|| env::var_os("MIRROR_CONFIG_FILENAME").map(PathBuf::from))
        .context("no configuration file: pass --config or set MIRROR_CONFIG_FILENAME")?;
    let text = fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let config: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("cannot parse {}", path.display()))?;

    for root in pathslicer_roots(&config) {
        if opts.init {
            fs::create_dir_all(root)
                .with_context(|| format!("failed to create directory {root}"))?;
            info!(%root, "root directory present");
        }
        println!("{root}");
    }
    Ok(())
}

/// All `root` values of `cls: pathslicing` mappings, in document order.
/// The scan descends through nested mappings but not below a matching node.
fn pathslicer_roots(config: &Value) -> Vec<&str> {
    let mut roots = Vec::new();
    collect_roots(config, &mut roots);
    roots
}

fn collect_roots<'a>(value: &'a Value, roots: &mut Vec<&'a str>) {
    let Value::Mapping(map) = value else {
        return;
    };
    if map.get("cls").and_then(Value::as_str) == Some("pathslicing") {
        if let Some(root) = map.get("root").and_then(Value::as_str) {
            roots.push(root);
        }
        return;
    }
    for (_, nested) in map {
        collect_roots(nested, roots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(yaml: &str) -> Vec<String> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        pathslicer_roots(&value)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn finds_nested_pathslicing_roots() {
        let yaml = r#"
objstorage:
  cls: multiplexer
  objstorages:
    primary:
      cls: pathslicing
      root: /srv/objects
      slicing: "0:2/2:4"
storage:
  cls: pipeline
  steps:
    objstorage:
      cls: pathslicing
      root: /srv/other
"#;
        assert_eq!(roots(yaml), vec!["/srv/objects", "/srv/other"]);
    }

    #[test]
    fn ignores_other_backends() {
        let yaml = r#"
objstorage:
  cls: remote
  url: http://objstorage:5003/
"#;
        assert!(roots(yaml).is_empty());
    }

    #[test]
    fn pathslicing_without_root_yields_nothing() {
        let yaml = "objstorage:\n  cls: pathslicing\n";
        assert!(roots(yaml).is_empty());
    }

    #[test]
    fn does_not_descend_below_a_match() {
        let yaml = r#"
cls: pathslicing
root: /srv/top
nested:
  cls: pathslicing
  root: /srv/ignored
"#;
        assert_eq!(roots(yaml), vec!["/srv/top"]);
    }

    #[test]
    fn init_creates_missing_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("objects/slices");
        let config = dir.path().join("storage.yml");
        fs::write(
            &config,
            format!(
                "objstorage:\n  cls: pathslicing\n  root: {}\n",
                root.display()
            ),
        )
        .unwrap();

        run(&Opts {
            config: Some(config),
            init: true,
        })
        .unwrap();
        assert!(root.is_dir());
    }
}
