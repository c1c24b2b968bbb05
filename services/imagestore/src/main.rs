//! imagestore: inspect and populate an image store from the command line.

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use eyre::WrapErr as _;
use tokio::io::AsyncWriteExt as _;
use tracing_subscriber::EnvFilter;

use imagestore::{ImageManifest, ImageSearcher, RegistryConfig, Searcher, UploadInfo};

/// Inspect and populate an image store.
#[derive(Parser, Debug)]
#[command(name = "imagestore", version, about)]
struct Cli {
    /// Configuration file naming the backing store.
    #[arg(long, short, default_value = "imagestore.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tags of an image.
    Tags {
        /// Image name
        name: String,
    },

    /// Print a manifest by tag or (possibly truncated) id.
    Manifest {
        /// Image name
        name: String,
        /// Tag or id
        reference: String,
    },

    /// Store a manifest read from a JSON file.
    PutManifest {
        /// Image name
        name: String,
        /// Tag, or the manifest's own id
        reference: String,
        /// Manifest JSON
        file: Utf8PathBuf,
    },

    /// Upload a file as a blob, in chunks.
    PushBlob {
        /// Image name the upload is made under
        name: String,
        /// File to upload
        file: Utf8PathBuf,
        /// Bytes per chunk
        #[arg(long, default_value_t = 1 << 20)]
        chunk_size: usize,
        /// Digest the upload must match
        #[arg(long)]
        digest: Option<String>,
        /// Media type to record for the blob
        #[arg(long)]
        media_type: Option<String>,
    },

    /// Write a blob's content to stdout.
    CatBlob {
        /// Image name
        name: String,
        /// Blob digest
        digest: String,
        /// Start this many bytes in
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn load(path: &Utf8Path) -> eyre::Result<ImageSearcher> {
    let text =
        std::fs::read_to_string(path).wrap_err_with(|| format!("reading config file {path}"))?;
    let config: RegistryConfig =
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing config file {path}"))?;
    tracing::debug!(?config, "loaded configuration");
    config.build().wrap_err("building storage")
}

async fn push_blob(
    searcher: &ImageSearcher,
    name: &str,
    file: &Utf8Path,
    chunk_size: usize,
    info: UploadInfo,
) -> eyre::Result<()> {
    let data = tokio::fs::read(file)
        .await
        .wrap_err_with(|| format!("reading {file}"))?;
    let info = UploadInfo {
        size: data.len() as u64,
        ..info
    };

    let location = searcher.prepare_blob_upload(name, &info).await?;
    tracing::info!(%location, size = info.size, "upload started");

    for (index, chunk) in data.chunks(chunk_size.max(1)).enumerate() {
        let index = u32::try_from(index).wrap_err("too many chunks")?;
        let mut writer = searcher
            .chunk_writer(&location.name, &location.session, index)
            .await?;
        writer.write_all(chunk).await?;
        writer.shutdown().await?;
        tracing::debug!(index, size = chunk.len(), "chunk written");
    }

    match searcher
        .complete_upload(&location.name, &location.session)
        .await
    {
        Ok(descriptor) => {
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(())
        }
        Err(error) => {
            if let Ok(cleanup) = searcher
                .cancel_upload(&location.name, &location.session)
                .await
            {
                cleanup.wait().await.ok();
            }
            Err(error.into())
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let searcher = load(&cli.config)?;

    match cli.command {
        Command::Tags { name } => {
            for tag in searcher.list_tags(&name).await? {
                println!("{tag}");
            }
        }
        Command::Manifest { name, reference } => {
            let manifest = searcher.get_manifest(&name, &reference).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::PutManifest {
            name,
            reference,
            file,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .wrap_err_with(|| format!("reading {file}"))?;
            let manifest = ImageManifest::parse(&data)?;
            searcher.put_manifest(&name, &reference, &manifest).await?;
            println!("{}", manifest.id);
        }
        Command::PushBlob {
            name,
            file,
            chunk_size,
            digest,
            media_type,
        } => {
            let info = UploadInfo {
                size: 0,
                digest,
                media_type,
            };
            push_blob(&searcher, &name, &file, chunk_size, info).await?;
        }
        Command::CatBlob {
            name,
            digest,
            offset,
        } => {
            let mut reader = searcher
                .blob_chunk_reader(&name, &digest, &digest, offset)
                .await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy_buf(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
