//! `keelctl ping`: liveness of configured databases and caches.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use keelctl_core::CoreConfig;
use keelctl_db::Databases;
use keelctl_lock::{Caches, KvStore};
use serde_json::json;

#[derive(Parser, Debug)]
pub struct PingArgs {
    /// Database names to ping (repeatable)
    #[arg(long = "database", short = 'D', value_name = "NAME")]
    databases: Vec<String>,

    /// Cache names to ping (repeatable)
    #[arg(long = "cache", short = 'C', value_name = "NAME")]
    caches: Vec<String>,

    /// Output format
    #[arg(long, value_parser = ["text", "json"], default_value = "text")]
    format: String,
}

struct Probe {
    kind: &'static str,
    name: String,
    ok: bool,
    detail: Option<String>,
}

async fn ping_cache(caches: &Caches, name: &str) -> std::result::Result<(), String> {
    let store = caches.store(name).await.map_err(|e| e.to_string())?;
    store.ping().await.map_err(|e| e.to_string())
}

pub async fn run_ping(args: PingArgs, config: CoreConfig) -> Result<ExitCode> {
    let mut database_names = args.databases;
    if database_names.is_empty() && args.caches.is_empty() {
        database_names.push("default".to_string());
    }

    let databases = Databases::new(config.clone());
    let caches = Caches::new(config);
    let mut probes = Vec::new();

    for name in database_names {
        let probe = match databases.database(&name).await {
            Ok(db) => Probe {
                kind: "database",
                ok: db.ping().await,
                detail: Some(db.driver().kind().to_string()),
                name,
            },
            Err(e) => Probe {
                kind: "database",
                ok: false,
                detail: Some(e.to_string()),
                name,
            },
        };
        probes.push(probe);
    }
    for name in args.caches {
        let result = ping_cache(&caches, &name).await;
        probes.push(Probe {
            kind: "cache",
            ok: result.is_ok(),
            detail: result.err(),
            name,
        });
    }
    databases.close_all().await;

    if args.format == "json" {
        let rows: Vec<_> = probes
            .iter()
            .map(|p| json!({ "kind": p.kind, "name": p.name, "ok": p.ok, "detail": p.detail }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for p in &probes {
            let status = if p.ok { "ok" } else { "unreachable" };
            match &p.detail {
                Some(detail) => println!("{:<8} {:<16} {} ({})", p.kind, p.name, status, detail),
                None => println!("{:<8} {:<16} {}", p.kind, p.name, status),
            }
        }
    }

    Ok(if probes.iter().all(|p| p.ok) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
