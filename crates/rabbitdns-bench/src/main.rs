mod scenarios;

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use directories::ProjectDirs;
use reqwest::blocking::Client;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::scenarios::{
    LatencySummary, PROFILE_ALLOWED, PROFILE_BLOCKED, QueryScenario, default_query_scenario,
    find_query_scenario, query_scenarios, summarise,
};

const DNS_JSON: &str = "application/dns-json";

#[derive(Parser, Debug)]
#[command(name = "rabbitdns-bench", version, about = "rabbitdns latency harness", long_about = None)]
struct BenchCli {
    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Location to write benchmark reports (defaults to the platform data dir).
    #[arg(long, value_parser = value_parser!(PathBuf))]
    output: Option<PathBuf>,

    /// Base URL of the proxy under test.
    #[arg(long, default_value = "http://127.0.0.1:8053")]
    endpoint: String,

    /// Host header presented to the proxy (selects the upstream provider).
    #[arg(long, default_value = "dns.rabbitdns.org")]
    host: String,

    /// Command to execute.
    #[command(subcommand)]
    command: BenchCommand,
}

#[derive(Subcommand, Debug)]
enum BenchCommand {
    /// Repeat JSON lookups and compare the first (cold) request to the rest.
    Query(QueryCommand),
    /// Create a profile and compare blocked answers to forwarded ones.
    Profile(ProfileCommand),
}

#[derive(Args, Debug)]
struct QueryCommand {
    /// Scenario identifier to execute (popular, ipv6, mail).
    #[arg(long, default_value = "popular")]
    scenario: String,

    /// Requests per name; defaults to the scenario's own count.
    #[arg(long)]
    iterations: Option<u32>,
}

#[derive(Args, Debug)]
struct ProfileCommand {
    /// Requests per name.
    #[arg(long, default_value_t = 10)]
    iterations: u32,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    kind: &'static str,
    label: String,
    endpoint: String,
    started_at: DateTime<Utc>,
    groups: Vec<LatencyGroup>,
}

#[derive(Debug, Serialize)]
struct LatencyGroup {
    label: &'static str,
    summary: Option<LatencySummary>,
}

#[derive(Debug, Deserialize)]
struct CreateProfileReply {
    error: u16,
    info: String,
    data: Option<CreatedProfile>,
}

#[derive(Debug, Deserialize)]
struct CreatedProfile {
    id: String,
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        "rabbitdns_bench=debug"
    } else {
        "rabbitdns_bench=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = BenchCli::parse();
    init_tracing(cli.verbose);

    let output_root = cli.output.clone().unwrap_or_else(|| {
        ProjectDirs::from("org", "rabbitdns", "RabbitDNS")
            .map(|dirs| dirs.data_dir().join("benchmarks"))
            .unwrap_or_else(|| PathBuf::from("./benchmarks"))
    });

    if let Err(err) = fs::create_dir_all(&output_root) {
        warn!(error = %err, path = %output_root.display(), "unable to create benchmark output directory");
    }

    info!(path = %output_root.display(), endpoint = %cli.endpoint, "Benchmark output root");

    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build benchmark HTTP client")?;
    let target = Target {
        client,
        endpoint: cli.endpoint.trim_end_matches('/').to_string(),
        host: cli.host.clone(),
    };

    let report = match &cli.command {
        BenchCommand::Query(cmd) => handle_query(cmd, &target)?,
        BenchCommand::Profile(cmd) => handle_profile(cmd, &target)?,
    };
    let path = write_report(&report, &output_root)?;
    println!("[{}] report written to {}", report.kind, path.display());
    Ok(())
}

struct Target {
    client: Client,
    endpoint: String,
    host: String,
}

impl Target {
    fn lookup(&self, host: &str, name: &str, record_type: &str) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/dns-query", self.endpoint))
            .query(&[("name", name), ("type", record_type)])
            .header(header::HOST, host)
            .header(header::ACCEPT, DNS_JSON)
            .send()
            .with_context(|| format!("lookup for {name} failed"))?;
        let status = response.status();
        let body = response.bytes()?;
        let elapsed = started.elapsed();
        if !status.is_success() {
            bail!("lookup for {name} returned {status}");
        }
        debug!(name, bytes = body.len(), elapsed_ms = elapsed.as_millis() as u64, "lookup");
        Ok(elapsed)
    }

    fn create_profile(&self, blocked: &[&str]) -> Result<String> {
        let reply: CreateProfileReply = self
            .client
            .post(format!("{}/createProfile", self.endpoint))
            .header(header::HOST, &self.host)
            .json(&serde_json::json!({ "blocked": blocked }))
            .send()
            .context("createProfile request failed")?
            .json()
            .context("createProfile returned an unexpected body")?;
        match reply.data {
            Some(created) if reply.error == 0 => Ok(created.id),
            _ => bail!("createProfile failed ({}): {}", reply.error, reply.info),
        }
    }
}

fn resolve_scenario(name: &str) -> &'static QueryScenario {
    find_query_scenario(name).unwrap_or_else(|| {
        let known: Vec<&str> = query_scenarios().iter().map(|s| s.name).collect();
        warn!(requested = %name, known = ?known, "unknown scenario; using default");
        default_query_scenario()
    })
}

fn handle_query(cmd: &QueryCommand, target: &Target) -> Result<BenchReport> {
    let scenario = resolve_scenario(&cmd.scenario);
    let iterations = cmd.iterations.unwrap_or(scenario.default_iterations).max(2);
    info!(
        scenario = scenario.name,
        description = scenario.description,
        iterations,
        "Executing query benchmark"
    );

    let started_at = Utc::now();
    let mut cold = Vec::new();
    let mut warm = Vec::new();
    for name in scenario.names {
        for round in 0..iterations {
            let elapsed = target.lookup(&target.host, name, scenario.record_type)?;
            if round == 0 {
                cold.push(elapsed);
            } else {
                warm.push(elapsed);
            }
        }
    }

    Ok(BenchReport {
        kind: "query",
        label: scenario.name.to_string(),
        endpoint: target.endpoint.clone(),
        started_at,
        groups: vec![
            LatencyGroup {
                label: "cold",
                summary: summarise(&cold),
            },
            LatencyGroup {
                label: "warm",
                summary: summarise(&warm),
            },
        ],
    })
}

fn handle_profile(cmd: &ProfileCommand, target: &Target) -> Result<BenchReport> {
    let started_at = Utc::now();
    let id = target.create_profile(PROFILE_BLOCKED)?;
    let profile_host = format!("{id}.{}", target.host);
    info!(profile = %id, iterations = cmd.iterations, "Executing profile benchmark");

    let mut blocked = Vec::new();
    let mut forwarded = Vec::new();
    for _ in 0..cmd.iterations.max(1) {
        for name in PROFILE_BLOCKED {
            blocked.push(target.lookup(&profile_host, name, "A")?);
        }
        for name in PROFILE_ALLOWED {
            forwarded.push(target.lookup(&profile_host, name, "A")?);
        }
    }

    Ok(BenchReport {
        kind: "profile",
        label: id,
        endpoint: target.endpoint.clone(),
        started_at,
        groups: vec![
            LatencyGroup {
                label: "blocked",
                summary: summarise(&blocked),
            },
            LatencyGroup {
                label: "forwarded",
                summary: summarise(&forwarded),
            },
        ],
    })
}

fn write_report(report: &BenchReport, output_root: &Path) -> Result<PathBuf> {
    let stamp = report.started_at.format("%Y%m%dT%H%M%SZ");
    let path = output_root.join(format!("{}-{stamp}.json", report.kind));
    let rendered = serde_json::to_vec_pretty(report)?;
    fs::write(&path, rendered)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_defaults() {
        let cli = BenchCli::parse_from(["rabbitdns-bench", "query"]);
        assert_eq!(cli.endpoint, "http://127.0.0.1:8053");
        match cli.command {
            BenchCommand::Query(cmd) => {
                assert_eq!(cmd.scenario, "popular");
                assert!(cmd.iterations.is_none());
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn parses_profile_options() {
        let cli = BenchCli::parse_from([
            "rabbitdns-bench",
            "--endpoint",
            "http://10.0.0.2:8053",
            "--host",
            "family.rabbitdns.org",
            "profile",
            "--iterations",
            "25",
        ]);
        assert_eq!(cli.host, "family.rabbitdns.org");
        match cli.command {
            BenchCommand::Profile(cmd) => assert_eq!(cmd.iterations, 25),
            _ => panic!("expected profile command"),
        }
    }

    #[test]
    fn unknown_scenario_falls_back_to_default() {
        assert_eq!(resolve_scenario("nope").name, "popular");
        assert_eq!(resolve_scenario("mail").record_type, "MX");
    }
}
