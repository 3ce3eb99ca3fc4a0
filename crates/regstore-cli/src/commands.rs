use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use rand::RngCore;
use regstore_core::{LocalDatabase, RegistryStorage, SignedMethod, METADATA_FILE};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::cli::*;

/// Upload read size for `tarball put`.
const READ_CHUNK: usize = 64 * 1024;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    debug!(config = %cli.config.display(), "opening registry");
    let storage = RegistryStorage::from_config_file(&cli.config)
        .with_context(|| format!("cannot open registry from {}", cli.config.display()))?;
    let out = Output { format: cli.format };

    match cli.command {
        Command::Packages(args) => cmd_packages(&storage, &out, args).await,
        Command::Secret(args) => cmd_secret(&storage, &out, args).await,
        Command::Meta(args) => cmd_meta(&storage, &out, args).await,
        Command::Tarball(args) => cmd_tarball(&storage, &out, args).await,
        Command::Purge(args) => cmd_purge(&storage, &out, args).await,
    }
}

struct Output {
    format: OutputFormat,
}

impl Output {
    fn json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print `value` as JSON, or run `text` for human output.
    fn emit(&self, value: Value, text: impl FnOnce()) {
        if self.json() {
            println!("{value}");
        } else {
            text();
        }
    }
}

async fn cmd_packages(
    storage: &RegistryStorage,
    out: &Output,
    args: PackagesArgs,
) -> anyhow::Result<()> {
    match args.action.unwrap_or(PackagesAction::List) {
        PackagesAction::List => {
            let packages = storage.list_packages().await?;
            out.emit(json!({ "packages": packages }), || {
                if packages.is_empty() {
                    println!("No packages.");
                }
                for name in &packages {
                    println!("  {}", name.yellow());
                }
            });
        }
        PackagesAction::Add { name } => {
            storage.add_package(&name).await?;
            out.emit(json!({ "added": name }), || {
                println!("{} Added {}", "✓".green().bold(), name.yellow());
            });
        }
        PackagesAction::Remove { name } => {
            storage.remove_package(&name).await?;
            out.emit(json!({ "removed": name }), || {
                println!("{} Removed {} from the index", "✓".green().bold(), name.yellow());
            });
        }
    }
    Ok(())
}

async fn cmd_secret(
    storage: &RegistryStorage,
    out: &Output,
    args: SecretArgs,
) -> anyhow::Result<()> {
    let secret = match args.action {
        SecretAction::Get => {
            let secret = storage.get_secret().await?;
            out.emit(json!({ "secret": secret }), || {
                if secret.is_empty() {
                    println!("{}", "(not set)".dimmed());
                } else {
                    println!("{secret}");
                }
            });
            return Ok(());
        }
        SecretAction::Set { value } => value,
        SecretAction::Generate { bytes } => {
            anyhow::ensure!(bytes > 0, "secret length must be positive");
            let mut raw = vec![0u8; bytes];
            rand::thread_rng().fill_bytes(&mut raw);
            hex::encode(raw)
        }
    };
    storage.set_secret(&secret).await?;
    out.emit(json!({ "secret": secret }), || {
        println!("{} Secret updated", "✓".green().bold());
    });
    Ok(())
}

async fn cmd_meta(storage: &RegistryStorage, out: &Output, args: MetaArgs) -> anyhow::Result<()> {
    match args.action {
        MetaAction::Get { package } => {
            let doc = storage.package_store(&package).read_metadata().await?;
            // metadata is JSON in both formats
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        MetaAction::Put { package, source, create } => {
            let raw = read_source(&source).await?;
            let doc: Value = serde_json::from_slice(&raw)
                .with_context(|| format!("{source} is not a JSON document"))?;
            let pkg = storage.package_store(&package);
            if create {
                pkg.create_metadata(&doc).await?;
            } else {
                pkg.update_metadata(&doc).await?;
            }
            out.emit(json!({ "package": package, "key": pkg.metadata_key() }), || {
                println!("{} Stored metadata for {}", "✓".green().bold(), package.yellow());
            });
        }
        MetaAction::Rm { package } => {
            storage.package_store(&package).delete_file(METADATA_FILE).await?;
            out.emit(json!({ "package": package, "deleted": METADATA_FILE }), || {
                println!("Deleted metadata for {}", package.yellow());
            });
        }
    }
    Ok(())
}

async fn cmd_tarball(
    storage: &RegistryStorage,
    out: &Output,
    args: TarballArgs,
) -> anyhow::Result<()> {
    match args.action {
        TarballAction::Put { package, file, name } => {
            let name = match name {
                Some(name) => name,
                None => file_name(&file)?,
            };
            let mut source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;

            let mut writer = storage.package_store(&package).write_tarball(&name);
            writer.opened().await?;
            let mut total = 0usize;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(buf[..n].to_vec()).await?;
                total += n;
            }
            let key = writer.key().to_string();
            writer.finish().await?;

            out.emit(json!({ "key": key, "bytes": total }), || {
                println!("{} Uploaded {} ({} bytes)", "✓".green().bold(), key.cyan(), total);
            });
        }
        TarballAction::Get { package, name, output } => {
            let mut reader = storage.package_store(&package).read_tarball(&name);
            let length = reader.open().await?;
            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("cannot create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(chunk) = reader.next_chunk().await {
                sink.write_all(&chunk?).await?;
            }
            sink.flush().await?;

            if let Some(path) = output {
                out.emit(json!({ "path": path, "bytes": length }), || {
                    println!("{} Wrote {} ({} bytes)", "✓".green().bold(), path.display(), length);
                });
            }
        }
        TarballAction::Rm { package, name } => {
            storage.package_store(&package).delete_file(&name).await?;
            out.emit(json!({ "package": package, "deleted": name }), || {
                println!("Deleted {}", name.yellow());
            });
        }
        TarballAction::Url { package, name, put } => {
            let method = if put { SignedMethod::Put } else { SignedMethod::Get };
            let url = storage
                .package_store(&package)
                .signed_tarball_url(&name, method)
                .await?;
            out.emit(json!({ "url": url }), || println!("{url}"));
        }
    }
    Ok(())
}

async fn cmd_purge(storage: &RegistryStorage, out: &Output, args: PurgeArgs) -> anyhow::Result<()> {
    let removed = storage.package_store(&args.package).remove_package().await?;
    if !args.keep_index {
        storage.remove_package(&args.package).await?;
    }
    out.emit(json!({ "package": args.package, "removed": removed }), || {
        println!(
            "{} Purged {} ({} objects)",
            "✓".green().bold(),
            args.package.yellow(),
            removed
        );
    });
    Ok(())
}

async fn read_source(source: &str) -> anyhow::Result<Vec<u8>> {
    let mut raw = Vec::new();
    if source == "-" {
        tokio::io::stdin().read_to_end(&mut raw).await?;
    } else {
        raw = tokio::fs::read(source)
            .await
            .with_context(|| format!("cannot read {source}"))?;
    }
    Ok(raw)
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no file name; pass --name", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_path() {
        assert_eq!(
            file_name(Path::new("/tmp/left-pad-1.3.0.tgz")).unwrap(),
            "left-pad-1.3.0.tgz"
        );
        assert!(file_name(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn read_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, br#"{"name":"x"}"#).unwrap();
        let raw = read_source(path.to_str().unwrap()).await.unwrap();
        assert_eq!(raw, br#"{"name":"x"}"#);
    }
}
