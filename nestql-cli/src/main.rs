use clap::{Parser, Subcommand, ValueEnum};
use nestql::document::DocumentQueryBuilder;
use nestql::migration::{create_statements, diff_catalogs};
use nestql::relational::{build_search_sql, Catalog};
use nestql::schema::parse_model;
use nestql::search::ResolvedSearch;
use nestql::{SearchRequest, Store};
use std::path::{Path, PathBuf};
use std::process;

/// NestQL CLI: compile searches and inspect storage layouts for a model
#[derive(Parser)]
#[command(name = "nestql", version, about)]
struct Cli {
    /// Path to the model file
    #[arg(long, default_value = "model.yaml")]
    model: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a search request into SQL
    Sql {
        /// Request as JSON, or @path to a JSON file
        request: String,
    },

    /// Compile a search request into document-store pipelines
    Pipeline {
        /// Request as JSON, or @path to a JSON file
        request: String,
    },

    /// Show the table layout of one resource, or of all of them
    Metadata {
        /// Resource name
        resource: Option<String>,
    },

    /// Print the DDL creating every table and index
    Ddl,

    /// Compare the model against an older one
    Diff {
        /// Path to the older model file
        old: PathBuf,
    },

    /// Run the integrity audit over a database
    Check {
        /// Path to the SQLite database
        #[arg(long)]
        db: PathBuf,
        /// Only check one resource
        #[arg(long)]
        resource: Option<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Sql { request } => {
            let model = parse_model(&cli.model)?;
            let search = ResolvedSearch::resolve(&model, &read_request(&request)?)?;
            let query = build_search_sql(&model, &search)?;
            print_output(
                &serde_json::json!({ "sql": query.sql, "params": query.params }),
                &cli.format,
            )?;
        }

        Command::Pipeline { request } => {
            let model = parse_model(&cli.model)?;
            let query = DocumentQueryBuilder::new(&model).build(&read_request(&request)?)?;
            print_output(&query.to_json(), &cli.format)?;
        }

        Command::Metadata { resource } => {
            let catalog = Catalog::new(&parse_model(&cli.model)?)?;
            let value = match resource {
                Some(name) => serde_json::to_value(catalog.resource(&name)?)?,
                None => serde_json::to_value(&catalog)?,
            };
            print_output(&value, &cli.format)?;
        }

        Command::Ddl => {
            let catalog = Catalog::new(&parse_model(&cli.model)?)?;
            for metadata in catalog.resources() {
                let structures: Vec<_> = metadata.structures.values().collect();
                for statement in create_statements(&structures) {
                    println!("{statement};");
                }
            }
        }

        Command::Diff { old } => {
            let old = Catalog::new(&parse_model(&old)?)?;
            let new = Catalog::new(&parse_model(&cli.model)?)?;
            let migrations: Vec<_> = diff_catalogs(&old, &new)
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "change": m.describe(),
                        "safe": m.is_safe(),
                        "statements": m.statements(&new),
                    })
                })
                .collect();
            print_output(&serde_json::Value::Array(migrations), &cli.format)?;
        }

        Command::Check { db, resource } => {
            let store = Store::open(&cli.model, &db)?;
            let reports = match resource {
                Some(name) => vec![store.check_integrity(&name)?],
                None => store.check_all_integrity()?,
            };
            print_output(&serde_json::to_value(&reports)?, &cli.format)?;
        }
    }

    Ok(())
}

fn read_request(arg: &str) -> Result<SearchRequest, Box<dyn std::error::Error>> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .map_err(|e| format!("Failed to read request file '{path}': {e}"))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
