use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use coldpack::{
    archive::{archive, ArchiveConfig},
    delete::{delete, DeleteConfig},
    extract::extract,
    manifest::ManifestReader,
    store::StoreHandle,
    validate::{validate, ValidateConfig},
};

/// coldpack
#[derive(Debug, Parser)]
#[clap(name = "coldpack", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bundle every object under a prefix into a tar archive plus a CSV
    /// manifest of byte offsets.
    Archive {
        /// source prefix, e.g. s3://bucket/prefix/
        source: String,
        /// output manifest path or URL (use a .gz suffix to compress)
        manifest: String,
        /// output archive path or URL
        archive: String,
        /// skip validating the archive against the manifest afterwards
        #[clap(long)]
        no_validate: bool,
        /// fetch pool width
        #[clap(long, default_value_t = 8)]
        concurrency: usize,
        /// replace existing outputs instead of refusing
        #[clap(long)]
        overwrite: bool,
    },
    /// Check every manifest row against the archive with range reads.
    Validate {
        manifest: String,
        archive: String,
        /// also re-list this source prefix and report drift
        #[clap(long)]
        source: Option<String>,
        #[clap(long, default_value_t = 8)]
        concurrency: usize,
    },
    /// Delete the source objects listed in a manifest.  Dry run unless
    /// --confirm is given.
    Delete {
        manifest: String,
        /// actually delete
        #[clap(long)]
        confirm: bool,
        /// store to delete from; defaults to s3://<Bucket> from the manifest
        #[clap(long)]
        source: Option<String>,
    },
    /// Extract one original file from the archive via a single range read.
    Extract {
        manifest: String,
        archive: String,
        /// the object key to extract
        key: String,
        /// output path; defaults to stdout
        #[clap(long)]
        out: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match App::parse().cmd {
        Command::Archive {
            source,
            manifest,
            archive: archive_url,
            no_validate,
            concurrency,
            overwrite,
        } => {
            let src = StoreHandle::parse(&source)?;
            let manifest = StoreHandle::parse(&manifest)?;
            let dest = StoreHandle::parse(&archive_url)?;
            let config = ArchiveConfig {
                concurrency,
                overwrite,
                ..ArchiveConfig::default()
            };

            let summary = archive(&src, &manifest, &dest, &config).await?;
            println!(
                "archived {} objects ({} bytes) into {}",
                summary.objects, summary.archive_len, archive_url
            );

            if !no_validate {
                let config = ValidateConfig {
                    concurrency,
                    ..ValidateConfig::default()
                };
                validate(&manifest, &dest, None, &config).await?;
                println!("validation passed");
            }
        }

        Command::Validate {
            manifest,
            archive,
            source,
            concurrency,
        } => {
            let manifest = StoreHandle::parse(&manifest)?;
            let archive = StoreHandle::parse(&archive)?;
            let source = source.as_deref().map(StoreHandle::parse).transpose()?;
            let config = ValidateConfig {
                concurrency,
                ..ValidateConfig::default()
            };

            let summary = validate(&manifest, &archive, source.as_ref(), &config).await?;
            println!("validated {} rows, zero mismatches", summary.rows);
        }

        Command::Delete {
            manifest,
            confirm,
            source,
        } => {
            let manifest = StoreHandle::parse(&manifest)?;
            let rows = ManifestReader::open(&manifest).await?.read_rows()?;
            let source = match source {
                Some(url) => StoreHandle::parse(&url)?,
                None => source_from_manifest(&rows)?,
            };

            let config = DeleteConfig {
                confirm,
                ..DeleteConfig::default()
            };
            let report = delete(&source, &rows, &config).await?;

            if !confirm {
                println!("dry run: {} keys would be deleted, for example:", report.requested);
                for row in rows.iter().take(10) {
                    println!("  {}", row.key);
                }
                println!("rerun with --confirm to delete them");
            } else {
                println!(
                    "deleted {} keys ({} already absent)",
                    report.deleted, report.already_absent
                );
                if !report.failed.is_empty() {
                    for (key, error) in &report.failed {
                        eprintln!("failed: {key}: {error}");
                    }
                    return Err(coldpack::Error::Delete {
                        failed: report.failed.len(),
                        requested: report.requested,
                    }
                    .into());
                }
            }
        }

        Command::Extract {
            manifest,
            archive,
            key,
            out,
        } => {
            let manifest = StoreHandle::parse(&manifest)?;
            let archive = StoreHandle::parse(&archive)?;
            let index = ManifestReader::open(&manifest).await?.index()?;

            match out {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("cannot create {path}"))?;
                    extract(&index, &archive, &key, &mut file).await?;
                }
                None => {
                    extract(&index, &archive, &key, &mut tokio::io::stdout()).await?;
                }
            }
        }
    }

    Ok(())
}

/// Reconstruct the delete target from the manifest's Bucket column when no
/// --source is given.  Works only for single-bucket S3 manifests.
fn source_from_manifest(rows: &[coldpack::manifest::ManifestRecord]) -> Result<StoreHandle> {
    let bucket = &rows[0].bucket;
    if bucket.is_empty() {
        bail!("manifest does not name a bucket; pass --source");
    }
    if let Some(other) = rows.iter().find(|r| &r.bucket != bucket) {
        bail!(
            "manifest spans multiple buckets ({bucket}, {}); pass --source",
            other.bucket
        );
    }
    Ok(StoreHandle::parse(&format!("s3://{bucket}"))?)
}
