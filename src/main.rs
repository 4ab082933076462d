use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use imgdedup::config::StorageSettings;
use imgdedup::storage::OssBlobStore;
use imgdedup::{
    Config, DEFAULT_REMOTE_FOLDER, FingerprintStore, HashAlgorithm, ImageDeduplicator,
    ImageHasher, ImageRepository, Originality, UploadError, open_blob_store,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Serialize, Debug, Default)]
struct UploadReport {
    timestamp: String,
    uploaded: Vec<String>,
    rejected: Vec<String>,
    failed: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(
    name = "imgdedup",
    version,
    about = "Upload images only when nothing similar is stored"
)]
struct Cli {
    /// Fingerprint database (overrides DB_PATH)
    #[arg(long, global = true, value_name = "FILE")]
    db_path: Option<PathBuf>,

    /// Primary hash variant: phash, ahash or dhash (overrides HASH_METHOD)
    #[arg(long, global = true, value_name = "METHOD")]
    hash_method: Option<HashAlgorithm>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload an image, or every image under a directory
    Upload {
        /// Image to upload
        #[arg(value_name = "IMAGE", required_unless_present = "dir")]
        image: Option<PathBuf>,
        /// Upload every image found under this directory
        #[arg(short, long, value_name = "DIR", conflicts_with = "image")]
        dir: Option<PathBuf>,
        /// Remote folder the images are stored under
        #[arg(short, long, default_value = DEFAULT_REMOTE_FOLDER)]
        folder: String,
        /// Maximum Hamming distance still counted as a duplicate
        #[arg(short, long)]
        threshold: Option<u32>,
        /// Append a JSON summary of a directory upload to this file
        #[arg(long, value_name = "FILE", requires = "dir")]
        report: Option<PathBuf>,
    },

    /// Check an image against the stored fingerprints without uploading it
    Check {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        #[arg(short, long)]
        threshold: Option<u32>,
    },

    /// List pairs of stored images that look alike
    Duplicates {
        #[arg(short, long)]
        threshold: Option<u32>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored records
    List {
        #[arg(long)]
        json: bool,
    },

    /// Print the access URL of a stored object (oss backend only)
    Url {
        #[arg(value_name = "KEY")]
        key: String,
        /// Signed URL lifetime in seconds (overrides OSS_URL_EXPIRES)
        #[arg(long, value_name = "SECONDS")]
        expires: Option<u64>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(method) = cli.hash_method {
        config.hash.algorithm = method;
    }

    match cli.command {
        Commands::Upload {
            image,
            dir,
            folder,
            threshold,
            report,
        } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let dedup = build_deduplicator(&config)?.with_threshold(threshold);

            if let Some(image) = image {
                println!("▶ Uploading {}", image.display());
                match dedup.upload_image(&image, &folder) {
                    Ok(receipt) => {
                        println!("✅ Stored as {}", receipt.path);
                        println!("   🔗 {}", receipt.location);
                    }
                    Err(UploadError::Rejected(reason)) => {
                        println!("⚠️  Not uploaded: {reason}");
                    }
                    Err(e) => return Err(e).context(format!("Upload of {:?} failed", image)),
                }
            } else if let Some(dir) = dir {
                let images = scan_directory(&dir)?;
                println!("▶ Uploading {} images from {}", images.len(), dir.display());

                let mut summary = UploadReport {
                    timestamp: Utc::now().to_rfc3339(),
                    ..UploadReport::default()
                };
                benchmark("uploading all images", || {
                    for image in &images {
                        let name = image.display().to_string();
                        match dedup.upload_image(image, &folder) {
                            Ok(receipt) => {
                                println!("   📦 {} → {}", name, receipt.path);
                                summary.uploaded.push(name);
                            }
                            Err(UploadError::Rejected(reason)) => {
                                println!("   ⏭️  {}: {}", name, reason);
                                summary.rejected.push(name);
                            }
                            Err(e) => {
                                if let Some(key) = e.orphaned_key() {
                                    eprintln!("   ❗ Orphaned blob left at {key}");
                                }
                                eprintln!("   ❌ {}: {}", name, e);
                                summary.failed.push(name);
                            }
                        }
                    }
                });

                println!(
                    "\n✅ {} uploaded, {} rejected, {} failed",
                    summary.uploaded.len(),
                    summary.rejected.len(),
                    summary.failed.len()
                );

                if let Some(report) = report {
                    let mut out = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&report)
                        .with_context(|| format!("Failed to open report file {:?}", report))?;
                    writeln!(out, "{}", serde_json::to_string(&summary)?)?;
                    println!("🗂️  Recorded upload summary in {}", report.display());
                }
            }
        }

        Commands::Check { image, threshold } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let dedup = build_deduplicator(&config)?;

            match dedup
                .check_originality(&image, threshold)
                .context("Failed to read the fingerprint store")?
            {
                Originality::Original => println!("✨ {} is original", image.display()),
                Originality::NotOriginal(reason) => {
                    println!("⚠️  {} is not original: {}", image.display(), reason)
                }
            }

            let similar = dedup.check_store_duplicate(&image, threshold)?;
            if !similar.is_empty() {
                println!("Similar stored images ({}):", dedup.hasher().algorithm());
                for hit in similar {
                    println!("   ▶ {} (distance {})", hit.path, hit.distance);
                }
            }
        }

        Commands::Duplicates { threshold, json } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let dedup = build_deduplicator(&config)?;
            let duplicates = benchmark("comparing stored fingerprints", || {
                dedup.find_duplicates(threshold)
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&duplicates)?);
            } else if duplicates.is_empty() {
                println!("No duplicates found.");
            } else {
                println!("Found {} duplicate pair(s):", duplicates.len());
                for (i, pair) in duplicates.iter().enumerate() {
                    println!(
                        " [{}] {} ↔ {} ({} distance {})",
                        i + 1,
                        pair.path_a,
                        pair.path_b,
                        pair.algorithm,
                        pair.distance
                    );
                }
            }
        }

        Commands::List { json } => {
            let repo = ImageRepository::new(&config.db_path)
                .with_context(|| format!("Failed to open {:?}", config.db_path))?;
            let records = repo.scan_all()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("🗂️  {} stored image(s):", records.len());
                for record in records {
                    println!("[{}] {}", record.id, record.storage_path);
                    for (algorithm, digest) in record.digests.iter() {
                        println!("     {algorithm}: {digest}");
                    }
                }
            }
        }

        Commands::Url { key, expires } => {
            let StorageSettings::Oss(settings) = &config.storage else {
                anyhow::bail!("`url` needs STORAGE_BACKEND=oss");
            };
            let store = OssBlobStore::new(settings)?;
            let expires = expires.map(Duration::from_secs).unwrap_or(settings.url_expiry);
            println!("{}", store.file_url(&key, expires));
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "imgdedup=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_deduplicator(config: &Config) -> Result<ImageDeduplicator> {
    let storage = open_blob_store(&config.storage).context("Failed to open blob storage")?;
    let repo = ImageRepository::new(&config.db_path)
        .with_context(|| format!("Failed to open {:?}", config.db_path))?;
    let hasher = ImageHasher::new(config.hash.clone()).context("Invalid hash settings")?;
    Ok(ImageDeduplicator::new(storage, Box::new(repo), hasher)
        .with_threshold(config.similarity_threshold))
}

/// Recursively walk `dir`, returning a Vec of image file paths.
fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let allowed_exts = ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if path.is_file() {
            if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                if allowed_exts.contains(&ext.to_lowercase().as_str()) {
                    images.push(path.to_path_buf());
                }
            }
        }
        spinner.tick();
    }
    images.sort();
    spinner.finish_with_message("Scan complete");
    Ok(images)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
