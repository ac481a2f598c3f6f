//! clawdeck: operator CLI over the reconciliation engine.
//!
//! Usage: `clawdeck [--offline] [--dry-run] [--no-heal] <command> [args...]`
//!
//! Every command prints JSON on stdout. A self-heal pass runs before the
//! command unless `--no-heal` is given.

use std::sync::Arc;

use clawdeck_core::{
    AgentRuntime, CliRuntime, ControlPlane, DeckConfig, DispatchRequest, Failure, OfflineRuntime,
};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const USAGE: &str = "\
usage: clawdeck [--offline] [--dry-run] [--no-heal] <command> [args...]

commands:
  heal                                   run self-heal and report repairs
  state                                  print the reconciled state view
  catalog <provider>                     merged model catalog for a provider
  active <provider>                      active models of a provider, annotated
  activate <key>...                      activate model keys
  deactivate <key>...                    deactivate model keys
  policy show <agent>                    effective model policy of an agent
  policy global <primary> [fallback...]  set the global policy
  policy agent <id> <primary> [fallback...]
  policy clear-agent <id>
  policy spawn <primary> [fallback...]   set the sub-agent spawn policy
  policy clear-spawn
  dispatch <agent> [--allow a,b] [--disable] [--max N] [--inherit]
  max-concurrent <n>                     set process-wide sub-agent concurrency
  providers                              list providers with profile counts
  set-key <provider> <api-key>           store an official provider key
  delete-provider <provider>
  search-chain [<primary> [fallback...]] show or set the search failover chain
  backups [--limit N]                    list backups, newest first
  rollback <backup-name>                 restore a backup
  settings                               print effective clawdeck settings";

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn required(args: &mut impl Iterator<Item = String>, what: &str) -> CliResult<String> {
    args.next()
        .ok_or_else(|| format!("missing {what}\n\n{USAGE}").into())
}

fn parse_dispatch(agent_args: Vec<String>) -> CliResult<DispatchRequest> {
    let mut request = DispatchRequest {
        enabled: true,
        ..DispatchRequest::default()
    };
    let mut args = agent_args.into_iter();
    while let Some(a) = args.next() {
        match a.as_str() {
            "--allow" => {
                let list = required(&mut args, "value for --allow")?;
                request.allow_agents = list.split(',').map(str::to_string).collect();
            }
            "--disable" => request.enabled = false,
            "--inherit" => request.inherit_max_concurrent = true,
            "--max" => {
                let n = required(&mut args, "value for --max")?;
                request.max_concurrent = Some(n.trim().parse()?);
            }
            other => return Err(format!("unknown dispatch flag {other:?}").into()),
        }
    }
    Ok(request)
}

async fn run(plane: &ControlPlane, command: &str, rest: Vec<String>) -> CliResult<()> {
    let mut args = rest.into_iter();
    match command {
        "heal" => print_json(&plane.self_heal()?),
        "state" => print_json(&plane.state()?),
        "catalog" => {
            let provider = required(&mut args, "provider")?;
            print_json(&plane.catalog(&provider).await?)
        }
        "active" => {
            let provider = required(&mut args, "provider")?;
            print_json(&plane.active_models(&provider).await?)
        }
        "activate" => print_json(&plane.activate_many(&args.collect::<Vec<_>>())),
        "deactivate" => print_json(&plane.deactivate_many(&args.collect::<Vec<_>>())),
        "policy" => {
            let action = required(&mut args, "policy action")?;
            match action.as_str() {
                "show" => {
                    let agent = required(&mut args, "agent id")?;
                    print_json(&plane.effective_policy(&agent)?)
                }
                "global" => {
                    let primary = required(&mut args, "primary model")?;
                    let fallbacks: Vec<String> = args.collect();
                    print_json(&plane.set_global_policy(Some(primary.as_str()), &fallbacks)?)
                }
                "agent" => {
                    let agent = required(&mut args, "agent id")?;
                    let primary = required(&mut args, "primary model")?;
                    let fallbacks: Vec<String> = args.collect();
                    print_json(&plane.set_agent_policy(&agent, Some(primary.as_str()), &fallbacks)?)
                }
                "clear-agent" => {
                    let agent = required(&mut args, "agent id")?;
                    print_json(&plane.clear_agent_policy(&agent)?)
                }
                "spawn" => {
                    let primary = required(&mut args, "primary model")?;
                    let fallbacks: Vec<String> = args.collect();
                    print_json(&plane.set_spawn_policy(Some(primary.as_str()), &fallbacks)?)
                }
                "clear-spawn" => print_json(&plane.clear_spawn_policy()?),
                other => Err(format!("unknown policy action {other:?}\n\n{USAGE}").into()),
            }
        }
        "dispatch" => {
            let agent = required(&mut args, "agent id")?;
            let flags: Vec<String> = args.collect();
            if flags.is_empty() {
                return print_json(&plane.dispatch_status(&agent)?);
            }
            let request = parse_dispatch(flags)?;
            print_json(&plane.set_dispatch_policy(&agent, &request)?)
        }
        "max-concurrent" => {
            let n: i64 = required(&mut args, "concurrency")?.trim().parse()?;
            let changed = plane.set_global_max_concurrent(n)?;
            print_json(&json!({ "maxConcurrent": n, "changed": changed }))
        }
        "providers" => print_json(&plane.providers()?),
        "set-key" => {
            let provider = required(&mut args, "provider")?;
            let key = required(&mut args, "api key")?;
            print_json(&plane.set_official_api_key(&provider, &key).await?)
        }
        "delete-provider" => {
            let provider = required(&mut args, "provider")?;
            print_json(&plane.delete_provider(&provider)?)
        }
        "search-chain" => match args.next() {
            None => print_json(&plane.search_failover_chain()?),
            Some(primary) => {
                let fallbacks: Vec<String> = args.collect();
                print_json(&plane.set_search_failover_chain(Some(primary.as_str()), &fallbacks)?)
            }
        },
        "backups" => {
            let limit = match (args.next().as_deref(), args.next()) {
                (Some("--limit"), Some(n)) => Some(n.trim().parse()?),
                (None, _) => None,
                _ => return Err("usage: clawdeck backups [--limit N]".into()),
            };
            print_json(&plane.list_backups(limit)?)
        }
        "rollback" => {
            let name = required(&mut args, "backup name")?;
            print_json(&plane.rollback(&name)?)
        }
        "settings" => {
            println!("{}", toml::to_string_pretty(plane.settings())?);
            Ok(())
        }
        other => Err(format!("unknown command {other:?}\n\n{USAGE}").into()),
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("[clawdeck] .env not loaded: {e}");
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut offline = false;
    let mut dry_run = false;
    let mut heal = true;
    let mut positional = Vec::new();
    for a in std::env::args().skip(1) {
        match a.as_str() {
            "--offline" => offline = true,
            "--dry-run" => dry_run = true,
            "--no-heal" => heal = false,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            _ => positional.push(a),
        }
    }
    if positional.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }
    let command = positional.remove(0);

    let mut settings = DeckConfig::load()?;
    settings.dry_run |= dry_run;

    let runtime: Arc<dyn AgentRuntime> = if offline {
        Arc::new(OfflineRuntime)
    } else {
        Arc::new(
            CliRuntime::new(settings.runtime_bin.clone(), settings.runtime_timeout())
                .with_config_path(settings.config_path.clone()),
        )
    };
    let plane = ControlPlane::open(settings, runtime);

    if heal && command != "heal" && command != "settings" {
        match plane.self_heal() {
            Ok(report) if !report.repairs.is_empty() || !report.purged_profiles.is_empty() => {
                tracing::info!(
                    target: "clawdeck::cli",
                    rewrites = report.repairs.rewrites.len(),
                    purged = report.purged_profiles.len(),
                    "startup self-heal applied repairs"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(target: "clawdeck::cli", error = %e, "startup self-heal failed"),
        }
    }

    if let Err(e) = run(&plane, &command, positional).await {
        match e.downcast_ref::<Failure>() {
            Some(failure) => {
                println!("{}", serde_json::to_string_pretty(&json!({ "error": failure }))?);
            }
            None => eprintln!("clawdeck: {e}"),
        }
        std::process::exit(1);
    }
    Ok(())
}
