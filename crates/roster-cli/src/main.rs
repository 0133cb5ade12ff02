//! # roster: command-line client for the directory hub
//!
//! - `roster compile --filter <json>`: compile a filter offline.
//! - `roster status`: hub health.
//! - `roster me`: who the token belongs to.
//! - `roster people --filter <json>`: exhaustive people search.
//! - `roster user <id>`: one cached user.
//! - `roster invalidate --prefix <p>`: drop cached entries.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use roster_core::{compile, CompileError, Filter};

/// ROSTER: exhaustive directory search.
#[derive(Parser)]
#[command(name = "roster", version, about, long_about = None)]
struct Cli {
    /// Hub base URL.
    #[arg(long, global = true, default_value = "http://127.0.0.1:3030")]
    hub: String,

    /// Bearer token (falls back to ROSTER_TOKEN).
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON filter into an upstream query, without a hub.
    Compile {
        #[arg(long, default_value = "null")]
        filter: String,
    },

    /// Report hub status as JSON.
    Status,

    /// Show the authenticated user.
    Me,

    /// Enumerate every user matching a filter.
    People {
        #[arg(long, default_value = "null")]
        filter: String,

        /// Fetch only the first page of each bucket.
        #[arg(long)]
        skip_paginate: bool,

        /// Print the raw JSON response instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Look up one user by upstream id.
    User { id: String },

    /// Drop cached entries whose key starts with `prefix`.
    Invalidate {
        #[arg(long)]
        prefix: String,
    },
}

#[derive(Debug, Deserialize)]
struct PersonJson {
    id: u64,
    user_id: String,
    #[serde(default)]
    user: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PeopleJson {
    people: Vec<PersonJson>,
    count: u64,
    complete: bool,
    #[serde(default)]
    truncated: Vec<String>,
}

#[derive(Tabled)]
struct PersonRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "USER")]
    user_id: String,
    #[tabled(rename = "EMAIL")]
    email: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ROLE")]
    role: String,
}

impl From<&PersonJson> for PersonRow {
    fn from(p: &PersonJson) -> Self {
        let field = |path: &[&str]| {
            let mut value = p.user.as_ref();
            for key in path {
                value = value.and_then(|v| v.get(*key));
            }
            value
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let name = format!("{} {}", field(&["given_name"]), field(&["family_name"]));
        Self {
            id: p.id,
            user_id: p.user_id.clone(),
            email: field(&["email"]),
            name: name.trim().to_string(),
            role: field(&["app_metadata", "role"]),
        }
    }
}

fn render_people(people: &PeopleJson) -> String {
    let rows: Vec<PersonRow> = people.people.iter().map(PersonRow::from).collect();
    let mut out = Table::new(rows).with(Style::psql()).to_string();
    out.push_str(&format!(
        "\n{} listed, {} reported upstream",
        people.people.len(),
        people.count
    ));
    if !people.complete {
        out.push_str(&format!(
            "\nincomplete: truncated buckets {}",
            people.truncated.join(", ")
        ));
    }
    out
}

/// `q` and `sort` for a JSON filter; `null` matches everyone.
fn compile_offline(filter: &str) -> Result<serde_json::Value, String> {
    let raw = parse_filter_arg(filter)?;
    let filter = if raw.is_null() {
        Filter::new()
    } else {
        Filter::from_json(&raw).map_err(|e: CompileError| e.to_string())?
    };
    Ok(serde_json::json!({
        "q": compile(&filter),
        "sort": filter.normalized_sort(),
    }))
}

fn parse_filter_arg(filter: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(filter).map_err(|e| format!("filter is not JSON: {}", e))
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { filter } => match compile_offline(&filter) {
            Ok(compiled) => print_json(&compiled),
            Err(e) => fail(&e),
        },

        // Hub commands
        cmd => {
            let token = cli.token.or_else(|| std::env::var("ROSTER_TOKEN").ok());
            let hub = Hub {
                client: reqwest::Client::new(),
                base_url: cli.hub.trim_end_matches('/').to_string(),
                token,
            };

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build tokio runtime");

            if let Err(e) = rt.block_on(async_main(&hub, cmd)) {
                fail(&e);
            }
        }
    }
}

async fn async_main(hub: &Hub, cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Status => print_json(&hub.get("/api/status").await?),

        Commands::Me => print_json(&hub.get("/api/me").await?),

        Commands::People {
            filter,
            skip_paginate,
            json,
        } => {
            let payload = serde_json::json!({
                "filter": parse_filter_arg(&filter)?,
                "skip_paginate": skip_paginate,
            });
            let response = hub.post("/api/people/search", &payload).await?;
            if json {
                print_json(&response);
            } else {
                let people: PeopleJson = serde_json::from_value(response)
                    .map_err(|e| format!("unexpected hub response: {}", e))?;
                println!("{}", render_people(&people));
            }
        }

        Commands::User { id } => {
            let payload = serde_json::json!({ "ids": [&id] });
            let response = hub.post("/api/users/batch", &payload).await?;
            match response.get(0) {
                Some(user) if !user.is_null() => print_json(user),
                _ => return Err(format!("user {} not found", id)),
            }
        }

        Commands::Invalidate { prefix } => {
            let response = hub
                .send(
                    hub.client
                        .delete(hub.url("/api/cache"))
                        .query(&[("prefix", prefix.as_str())]),
                )
                .await?;
            print_json(&response);
        }

        Commands::Compile { .. } => {}
    }
    Ok(())
}

struct Hub {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Hub {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, String> {
        self.send(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, json: &serde_json::Value) -> Result<serde_json::Value, String> {
        self.send(self.client.post(self.url(path)).json(json)).await
    }

    async fn send(&self, mut req: reqwest::RequestBuilder) -> Result<serde_json::Value, String> {
        if let Some(k) = self.token.as_deref() {
            req = req.header("Authorization", format!("Bearer {}", k));
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());
        Err(format!("hub returned {}: {}", status.as_u16(), message))
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_offline() {
        let compiled =
            compile_offline(r#"{ "role": "teacher", "sort": "-last_name" }"#).unwrap();
        assert_eq!(compiled["q"], r#"app_metadata.role:"teacher""#);
        assert_eq!(compiled["sort"], "family_name:-1");
    }

    #[test]
    fn test_compile_null_filter() {
        let compiled = compile_offline("null").unwrap();
        assert_eq!(compiled["q"], "");
        assert!(compiled["sort"].is_null());
    }

    #[test]
    fn test_compile_rejects_bad_input() {
        assert!(compile_offline("{not json").is_err());
        assert!(compile_offline(r#"{ "shoe_size": 9 }"#)
            .unwrap_err()
            .contains("shoe_size"));
    }

    #[test]
    fn test_global_options_parse() {
        let cli = Cli::try_parse_from([
            "roster",
            "people",
            "--filter",
            r#"{"role":"learner"}"#,
            "--skip-paginate",
            "--hub",
            "http://hub:9000",
        ])
        .unwrap();
        assert_eq!(cli.hub, "http://hub:9000");
        assert!(cli.token.is_none());
        match cli.command {
            Commands::People {
                skip_paginate,
                json,
                ..
            } => {
                assert!(skip_paginate);
                assert!(!json);
            }
            _ => panic!("expected people"),
        }
    }

    #[test]
    fn test_render_people_table() {
        let people: PeopleJson = serde_json::from_value(serde_json::json!({
            "people": [
                {
                    "id": 1,
                    "user_id": "auth0|1",
                    "created_at": "2024-01-01T00:00:00Z",
                    "user": {
                        "user_id": "auth0|1",
                        "email": "jane@x.com",
                        "given_name": "Jane",
                        "family_name": "Doe",
                        "app_metadata": { "role": "teacher" }
                    }
                },
                { "id": 2, "user_id": "auth0|2", "created_at": "2024-01-01T00:00:00Z", "user": null }
            ],
            "count": 2,
            "complete": false,
            "truncated": ["zz*"]
        }))
        .unwrap();
        let out = render_people(&people);
        assert!(out.contains("jane@x.com"));
        assert!(out.contains("Jane Doe"));
        assert!(out.contains("teacher"));
        assert!(out.contains("auth0|2"));
        assert!(out.contains("2 listed, 2 reported upstream"));
        assert!(out.contains("truncated buckets zz*"));
    }
}
