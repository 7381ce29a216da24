use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use larkgate::fields::FieldMapping;
use larkgate::lark::{BitableClient, DriveClient, FileBody, ImClient, LarkClient, UploadForm};
use larkgate::multipart::{self, Part};
use larkgate::notify::{today_in, NotifyJob};
use larkgate::Config;

/// Lark / Feishu Bitable, Drive and deadline notifications from the command line
#[derive(Parser)]
#[command(name = "larkgate", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send deadline cards to every assignee with overdue or upcoming tasks
    Notify {
        /// Build the cards and print them without sending
        #[arg(long)]
        dry_run: bool,

        /// Evaluate deadlines as of this date (YYYY-MM-DD) instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// List the tables of a Bitable app
    Tables {
        #[arg(long)]
        app_token: Option<String>,
    },

    /// Dump every table of an app with all of its records
    Snapshot {
        #[arg(long)]
        app_token: Option<String>,
    },

    /// Dump every record of a table
    Records {
        table_id: String,

        #[arg(long)]
        app_token: Option<String>,
    },

    /// Upload a file and attach it to a record
    Upload {
        path: PathBuf,

        #[arg(long)]
        table: String,

        #[arg(long)]
        record: String,

        /// Attachment field (defaults to bitable.attachment_field)
        #[arg(long)]
        field: Option<String>,

        #[arg(long, default_value = multipart::DEFAULT_CONTENT_TYPE)]
        content_type: String,

        #[arg(long)]
        app_token: Option<String>,
    },

    /// Attach the file of a saved multipart/form-data upload to its record
    ///
    /// Routing comes from the flags, then the form's app_token, table_id and
    /// record_id fields, then bitable.app_token.
    UploadForm {
        body: PathBuf,

        /// The request's Content-Type header, including the boundary
        #[arg(long)]
        content_type: String,

        #[arg(long)]
        table: Option<String>,

        #[arg(long)]
        record: Option<String>,

        /// Attachment field (defaults to bitable.attachment_field)
        #[arg(long)]
        field: Option<String>,

        #[arg(long)]
        app_token: Option<String>,
    },

    /// Download a media file by token
    Download {
        file_token: String,

        /// Output path (defaults to the file token in the current directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Create a record from a JSON object of fields
    CreateRecord {
        table: String,

        /// JSON object
        fields: String,

        #[arg(long, value_enum, default_value_t = Mapping::Raw)]
        mapping: Mapping,

        #[arg(long)]
        app_token: Option<String>,
    },

    /// Update a record from a JSON object of fields
    UpdateRecord {
        table: String,

        record: String,

        /// JSON object
        fields: String,

        #[arg(long, value_enum, default_value_t = Mapping::Raw)]
        mapping: Mapping,

        #[arg(long)]
        app_token: Option<String>,
    },

    /// Decode a saved multipart/form-data body and describe its parts
    DecodeMultipart {
        file: PathBuf,

        /// The request's Content-Type header, including the boundary
        #[arg(long)]
        content_type: String,
    },

    /// Config utilities
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mapping {
    /// Field names are Bitable field names
    Raw,
    /// Task creation keys (name, assignee, dueDate, ...)
    TaskCreate,
    /// Task update keys (status, dueDate, outputUrl, ...)
    TaskUpdate,
}

impl Mapping {
    fn apply(
        self,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mapping = match self {
            Self::Raw => return Ok(input),
            Self::TaskCreate => FieldMapping::task_create(),
            Self::TaskUpdate => FieldMapping::task_update(),
        };
        Ok(mapping.apply(&input)?)
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_with_env(path),
        None => match Config::default_path() {
            Some(path) => Config::load_with_env(&path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides(|key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
        },
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_fields(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("fields must be a JSON object")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("fields must be a JSON object"),
    }
}

struct App {
    config: Config,
}

/// Routing overrides for `upload-form`.
struct FormRoute {
    table: Option<String>,
    record: Option<String>,
    field: Option<String>,
    app_token: Option<String>,
}

impl App {
    fn client(&self) -> Result<LarkClient> {
        Ok(LarkClient::from_config(&self.config.lark)?)
    }

    fn bitable(&self, client: &LarkClient, app_token: Option<String>) -> Result<BitableClient> {
        let app_token = app_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.config.bitable.app_token.clone());
        if app_token.is_empty() {
            bail!("no Bitable app token: pass --app-token, set bitable.app_token or LARK_APP_TOKEN");
        }
        Ok(BitableClient::new(client.clone(), app_token)
            .with_page_size(self.config.bitable.page_size))
    }

    async fn notify(&self, dry_run: bool, today: Option<NaiveDate>) -> Result<()> {
        let notify = &self.config.notify;
        for (key, value) in [
            ("notify.tasks_table", &notify.tasks_table),
            ("notify.members_table", &notify.members_table),
            ("notify.projects_table", &notify.projects_table),
        ] {
            if value.is_empty() {
                bail!("{key} is not configured");
            }
        }
        let tz = notify.tz()?;
        let client = self.client()?;
        let bitable = self.bitable(&client, None)?;
        let sender = Arc::new(ImClient::new(client));
        let job = NotifyJob::new(bitable, sender, notify.clone(), tz);

        let report = job
            .run(today.unwrap_or_else(|| today_in(tz)), dry_run)
            .await
            .context("notification run failed")?;
        print_json(&report)
    }

    async fn upload(
        &self,
        path: &Path,
        table: &str,
        record: &str,
        field: Option<String>,
        content_type: String,
        app_token: Option<String>,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let field = field.unwrap_or_else(|| self.config.bitable.attachment_field.clone());

        let client = self.client()?;
        let bitable = self.bitable(&client, app_token)?;
        let drive = DriveClient::new(client)
            .with_max_upload_bytes(self.config.lark.max_upload_bytes);
        let (file_token, updated) = drive
            .attach_to_record(
                &bitable,
                table,
                record,
                &field,
                FileBody {
                    file_name: file_name.clone(),
                    content_type,
                    bytes,
                },
            )
            .await?;
        print_json(&serde_json::json!({
            "file_token": file_token,
            "file_name": file_name,
            "record_id": updated.record_id,
        }))
    }

    async fn upload_form(&self, body: &Path, content_type: &str, route: FormRoute) -> Result<()> {
        let raw = tokio::fs::read(body)
            .await
            .with_context(|| format!("failed to read {}", body.display()))?;
        let form = UploadForm::parse(&raw, content_type, self.config.lark.max_upload_bytes)?;
        let target = form.target(
            route.app_token.as_deref(),
            route.table.as_deref(),
            route.record.as_deref(),
            &self.config.bitable.app_token,
        )?;
        let field = route
            .field
            .unwrap_or_else(|| self.config.bitable.attachment_field.clone());
        let file_name = form.file.file_name.clone();

        let drive = DriveClient::new(self.client()?)
            .with_max_upload_bytes(self.config.lark.max_upload_bytes);
        let (file_token, updated) = drive.attach_form(form, &target, &field).await?;
        print_json(&serde_json::json!({
            "file_token": file_token,
            "file_name": file_name,
            "table_id": target.table_id,
            "record_id": updated.record_id,
        }))
    }

    async fn download(&self, file_token: &str, output: Option<PathBuf>) -> Result<()> {
        let drive = DriveClient::new(self.client()?);
        let download = drive.download_media(file_token).await?;
        let output = output.unwrap_or_else(|| PathBuf::from(file_token));
        tokio::fs::write(&output, &download.bytes)
            .await
            .with_context(|| format!("failed to write {}", output.display()))?;
        print_json(&serde_json::json!({
            "file_token": file_token,
            "path": output.display().to_string(),
            "size": download.bytes.len(),
            "content_type": download.content_type,
        }))
    }

    async fn decode_multipart(&self, file: &Path, content_type: &str) -> Result<()> {
        let body = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let message = multipart::decode_with_content_type(&body, content_type)?;
        let parts: Vec<serde_json::Value> = message
            .parts()
            .iter()
            .map(|part| match part {
                Part::Text { name, value } => serde_json::json!({
                    "name": name,
                    "kind": "text",
                    "value": value,
                }),
                Part::File {
                    name,
                    filename,
                    content_type,
                    bytes,
                } => serde_json::json!({
                    "name": name,
                    "kind": "file",
                    "filename": filename,
                    "content_type": content_type,
                    "size": bytes.len(),
                }),
            })
            .collect();
        let oversized = message
            .attachment()
            .is_some_and(|a| a.bytes.len() > self.config.lark.max_upload_bytes);
        print_json(&serde_json::json!({
            "parts": parts,
            "has_attachment": message.attachment().is_some(),
            "exceeds_upload_limit": oversized,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        command: ConfigCommands::Schema,
    } = &cli.command
    {
        return print_json(&Config::json_schema());
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.log_level);
    let app = App { config };

    match cli.command {
        Commands::Notify { dry_run, today } => app.notify(dry_run, today).await,
        Commands::Tables { app_token } => {
            let tables = app.bitable(&app.client()?, app_token)?.list_tables().await?;
            print_json(&tables)
        }
        Commands::Snapshot { app_token } => {
            let snapshot = app.bitable(&app.client()?, app_token)?.snapshot().await?;
            print_json(&snapshot)
        }
        Commands::Records {
            table_id,
            app_token,
        } => {
            let records = app
                .bitable(&app.client()?, app_token)?
                .fetch_all(&table_id)
                .await?;
            print_json(&records)
        }
        Commands::Upload {
            path,
            table,
            record,
            field,
            content_type,
            app_token,
        } => {
            app.upload(&path, &table, &record, field, content_type, app_token)
                .await
        }
        Commands::UploadForm {
            body,
            content_type,
            table,
            record,
            field,
            app_token,
        } => {
            let route = FormRoute {
                table,
                record,
                field,
                app_token,
            };
            app.upload_form(&body, &content_type, route).await
        }
        Commands::Download { file_token, output } => app.download(&file_token, output).await,
        Commands::CreateRecord {
            table,
            fields,
            mapping,
            app_token,
        } => {
            let fields = mapping.apply(parse_fields(&fields)?)?;
            let created = app
                .bitable(&app.client()?, app_token)?
                .create_record(&table, fields)
                .await?;
            print_json(&created)
        }
        Commands::UpdateRecord {
            table,
            record,
            fields,
            mapping,
            app_token,
        } => {
            let fields = mapping.apply(parse_fields(&fields)?)?;
            let updated = app
                .bitable(&app.client()?, app_token)?
                .update_record(&table, &record, fields)
                .await?;
            print_json(&updated)
        }
        Commands::DecodeMultipart { file, content_type } => {
            app.decode_multipart(&file, &content_type).await
        }
        Commands::Config { .. } => Ok(()),
    }
}
