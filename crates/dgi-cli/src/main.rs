use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dgi_adapters::{CatalogSource, DataGovApi, FetchContext, FixtureCatalog, ResourceQuery};
use dgi_core::{Attribute, ResourceField};
use dgi_storage::{MetadataStore, RecencyKind, SearchQuery};
use dgi_sync::{Mirror, SyncConfig};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dgi")]
#[command(about = "Local mirror of the data.gov.in resource catalog")]
struct Cli {
    /// Serve the catalog from a listing file instead of the remote API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize the local mirror (incremental unless --full).
    Sync {
        #[arg(long)]
        full: bool,
    },
    /// Distinct values of one attribute, or all of them.
    Attributes { name: Option<String> },
    /// Resources updated (or created) within the last N days.
    Recent {
        #[arg(long)]
        created: bool,
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    Search {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        org_type: Option<String>,
        #[arg(long)]
        sector: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Stored metadata of one resource.
    Info {
        index_name: String,
        #[arg(long)]
        fields: Option<String>,
    },
    /// Live metadata and record count of one resource.
    Describe { index_name: String },
    /// Records of one resource from the remote API.
    Records {
        index_name: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        offset: Option<usize>,
        /// Field filter as `field=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Page through every matching record.
        #[arg(long)]
        all: bool,
    },
    Serve,
}

#[derive(Debug, Args)]
struct OutputArgs {
    #[arg(long, default_value_t = 10)]
    max_results: usize,
    #[arg(long)]
    fields: Option<String>,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected field=value, got `{raw}`"))
}

fn parse_fields(fields: Option<&str>) -> Result<Vec<ResourceField>> {
    Ok(fields
        .map(ResourceField::parse_list)
        .transpose()?
        .unwrap_or_default())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn catalog_source(config: &SyncConfig, fixture: Option<&PathBuf>) -> Result<Arc<dyn CatalogSource>> {
    match fixture {
        Some(path) => Ok(Arc::new(FixtureCatalog::load(path)?)),
        None => dgi_sync::api_source(config),
    }
}

async fn open_store(config: &SyncConfig) -> Result<MetadataStore> {
    MetadataStore::open(config.database_path())
        .await
        .with_context(|| format!("opening {}", config.database_path().display()))
}

/// Mirror for read commands; refreshed first when auto refresh is on.
async fn open_mirror(config: &SyncConfig, fixture: Option<&PathBuf>) -> Result<Mirror> {
    Mirror::open(config, catalog_source(config, fixture)?).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Sync { full: false });

    match command {
        Commands::Sync { full } => {
            let mirror = Mirror::new(
                open_store(&config).await?,
                catalog_source(&config, cli.fixture.as_ref())?,
                config.mirror_options(),
            );
            let full = full || mirror.store().count().await? == 0;
            print_json(&mirror.refresh(full).await?)?;
        }
        Commands::Attributes { name } => {
            let mirror = open_mirror(&config, cli.fixture.as_ref()).await?;
            match name {
                Some(name) => {
                    let attribute: Attribute = name.parse()?;
                    print_json(&mirror.list_attribute(attribute).await?)?;
                }
                None => print_json(&mirror.list_all_attributes().await?)?,
            }
        }
        Commands::Recent {
            created,
            days,
            output,
        } => {
            let mirror = open_mirror(&config, cli.fixture.as_ref()).await?;
            let kind = if created {
                RecencyKind::Created
            } else {
                RecencyKind::Updated
            };
            let fields = parse_fields(output.fields.as_deref())?;
            print_json(
                &mirror
                    .list_recent(kind, days, output.max_results, &fields)
                    .await?,
            )?;
        }
        Commands::Search {
            title,
            description,
            org,
            org_type,
            sector,
            source,
            output,
        } => {
            let mirror = open_mirror(&config, cli.fixture.as_ref()).await?;
            let query = SearchQuery {
                title,
                description,
                org,
                org_type,
                sector,
                source,
            };
            let fields = parse_fields(output.fields.as_deref())?;
            print_json(&mirror.search(&query, output.max_results, &fields).await?)?;
        }
        Commands::Info { index_name, fields } => {
            let mirror = open_mirror(&config, cli.fixture.as_ref()).await?;
            let fields = parse_fields(fields.as_deref())?;
            print_json(&mirror.resource_info(&index_name, &fields).await?)?;
        }
        Commands::Describe { index_name } => {
            if cli.fixture.is_some() {
                bail!("describe reads the remote API and cannot use --fixture");
            }
            let api = DataGovApi::new(config.api_config())?;
            let description = api
                .describe_resource(&FetchContext::new(Uuid::new_v4()), &index_name)
                .await?;
            print_json(&serde_json::json!({
                "metadata": description.metadata,
                "total": description.total,
            }))?;
        }
        Commands::Records {
            index_name,
            limit,
            offset,
            filters,
            fields,
            all,
        } => {
            if cli.fixture.is_some() {
                bail!("records reads the remote API and cannot use --fixture");
            }
            let api = DataGovApi::new(config.api_config())?;
            let ctx = FetchContext::new(Uuid::new_v4());
            let query = ResourceQuery {
                offset,
                limit: Some(limit),
                filters: filters.into_iter().collect(),
                fields: (!fields.is_empty()).then_some(fields),
            };
            if all {
                let mut pager = api.pager(ctx, index_name, query, limit);
                let mut records = Vec::new();
                while let Some(page) = pager.next_page().await? {
                    records.extend(page);
                }
                print_json(&records)?;
            } else {
                let payload = api.fetch_resource(&ctx, &index_name, &query).await?;
                print_json(&serde_json::json!({
                    "total": payload.total,
                    "field": payload.field,
                    "records": payload.records,
                }))?;
            }
        }
        Commands::Serve => {
            let source = catalog_source(&config, cli.fixture.as_ref())?;
            dgi_web::serve(config, source).await?;
        }
    }

    Ok(())
}
