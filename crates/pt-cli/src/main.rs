//! policytester command-line entry point.
//!
//! Loads a test specification, resolves and validates it, and drives
//! the orchestrator against the cluster reachable through the local
//! kubeconfig. Validation errors are printed with source-line context
//! before any cluster interaction begins.

use anyhow::{anyhow, bail, Context};
use pt_core::cluster::{ContainerSpec, PodHandle};
use pt_core::errors::PtError;
use pt_core::loader;
use pt_core::orchestrator::PolicyTester;
use pt_core::report::TestReport;
use pt_core::resolver;
use pt_kube::KubeCluster;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: policytester <COMMAND> <TESTS.yaml> [OPTIONS]

Commands:
  check     Resolve and validate the specification, no cluster access
  prepare   Instrument source pods and wait for readiness
  test      Execute the probe matrix against prepared pods
  cleanup   Delete pods instrumented by an earlier run
  run       prepare + test + cleanup in one invocation

Options:
  --image <IMAGE>            Debug container image (default: nicolaka/netshoot)
  --container-name <NAME>    Debug container name (default: policytester-debug)
  --namespace <NAMESPACE>    Restrict pod listing to one namespace
  --ready-timeout <SECONDS>  Readiness wait timeout (default: 60)
  --probe-timeout <SECONDS>  Per-probe exec timeout (default: 10)
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Check,
    Prepare,
    Test,
    Cleanup,
    Run,
}

struct CliArgs {
    verb: Verb,
    file: PathBuf,
    image: Option<String>,
    container_name: Option<String>,
    namespace: Option<String>,
    ready_timeout: u64,
    probe_timeout: u64,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let verb = match args.next().as_deref() {
        Some("check") => Verb::Check,
        Some("prepare") => Verb::Prepare,
        Some("test") => Verb::Test,
        Some("cleanup") => Verb::Cleanup,
        Some("run") => Verb::Run,
        Some(other) => return Err(format!("unknown command '{other}'")),
        None => return Err("missing command".to_string()),
    };
    let file = PathBuf::from(args.next().ok_or("missing specification file")?);

    let mut parsed = CliArgs {
        verb,
        file,
        image: None,
        container_name: None,
        namespace: None,
        ready_timeout: 60,
        probe_timeout: 10,
    };
    while let Some(flag) = args.next() {
        let mut value = |flag: &str| {
            args.next().ok_or(format!("{flag} requires a value"))
        };
        match flag.as_str() {
            "--image" => parsed.image = Some(value("--image")?),
            "--container-name" => parsed.container_name = Some(value("--container-name")?),
            "--namespace" => parsed.namespace = Some(value("--namespace")?),
            "--ready-timeout" => {
                parsed.ready_timeout = value("--ready-timeout")?
                    .parse()
                    .map_err(|_| "--ready-timeout must be a number".to_string())?;
            }
            "--probe-timeout" => {
                parsed.probe_timeout = value("--probe-timeout")?
                    .parse()
                    .map_err(|_| "--probe-timeout must be a number".to_string())?;
            }
            other => return Err(format!("unknown option '{other}'")),
        }
    }
    Ok(parsed)
}

fn print_summary(report: &TestReport) {
    for suite in report.suites() {
        println!("RULE {}", suite.name);
        for case in &suite.cases {
            let verdict = if case.ok { "PASS" } else { "FAIL" };
            println!(
                "  {verdict} {} ({:.2}s)",
                case.name,
                case.duration.as_secs_f64()
            );
            if !case.ok && !case.output.is_empty() {
                for line in case.output.lines() {
                    println!("       {line}");
                }
            }
        }
        println!(
            "  PASS={} FAIL={} TIME={:.2}s",
            suite.tests - suite.failures,
            suite.failures,
            suite.duration.as_secs_f64()
        );
    }
    println!(
        "TOTAL PASS={} FAIL={} TIME={:.2}s",
        report.tests() - report.failures(),
        report.failures(),
        report.duration().unwrap_or_default().as_secs_f64()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pt_cli=info,pt_core=info,pt_kube=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            return Err(anyhow!("invalid arguments"));
        }
    };

    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;
    let doc = loader::load_document(&source)
        .with_context(|| format!("cannot parse {}", args.file.display()))?;
    let (model, errors) = resolver::resolve(&doc);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("ERROR: {error}");
        }
        return Err(PtError::InvalidSpec(errors.len()).into());
    }
    info!(
        pods = model.pods.len(),
        targets = model.targets.len(),
        rules = model.rules.len(),
        "specification resolved"
    );

    if args.verb == Verb::Check {
        println!("specification OK: {} rule(s)", model.rules.len());
        return Ok(());
    }

    let mut container = ContainerSpec::default();
    if let Some(image) = args.image {
        container.image = image;
    }
    if let Some(name) = args.container_name {
        container.name = name;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let cluster = KubeCluster::try_default().await?;
    let mut tester = PolicyTester::new(&model, cluster, container)
        .with_probe_timeout(Duration::from_secs(args.probe_timeout))
        .with_cancellation(cancel);
    if let Some(namespace) = &args.namespace {
        tester = tester.with_namespace(namespace);
    }
    let ready_timeout = Duration::from_secs(args.ready_timeout);

    match args.verb {
        // Handled above, before any cluster connection.
        Verb::Check => return Ok(()),
        Verb::Prepare => {
            let pods = tester.prepare().await?;
            let pending = tester.wait_until_ready(pods, ready_timeout).await;
            for pod in &pending {
                warn!(pod = %pod.name(), "pod not ready");
            }
            if !pending.is_empty() {
                bail!("{} pod(s) not ready after {}s", pending.len(), args.ready_timeout);
            }
            info!("all source pods ready");
        }
        Verb::Cleanup => {
            let deleted = tester.cleanup().await?;
            info!(deleted, "cleanup complete");
        }
        Verb::Test => {
            tester.test().await?;
            let report = tester.into_report();
            print_summary(&report);
            if !report.passed() {
                bail!("{} probe failure(s)", report.failures());
            }
        }
        Verb::Run => {
            let pods = tester.prepare().await?;
            let pending = tester.wait_until_ready(pods, ready_timeout).await;
            if !pending.is_empty() {
                warn!(
                    not_ready = pending.len(),
                    "continuing with pods not ready, their probes will fail"
                );
            }
            let outcome = tester.test().await.map(|_| ());
            if let Err(error) = tester.cleanup().await {
                warn!(error = %error, "cleanup failed");
            }
            outcome?;
            let report = tester.into_report();
            print_summary(&report);
            if !report.passed() {
                bail!("{} probe failure(s)", report.failures());
            }
        }
    }

    Ok(())
}
