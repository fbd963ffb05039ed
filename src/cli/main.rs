use sigpolicy::audit::{self, AuditConfig, LogDestination};
use sigpolicy::roots::TrustRootProvider;
use sigpolicy::{PolicyError, Verifier, VerifierConfig};

use sigpolicy::reexports::log;
use sigpolicy::reexports::tokio_util::sync::CancellationToken;

use clap::{Arg, ArgAction, ArgMatches, Command, crate_description, crate_name, crate_version};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

fn read_input(path: &str) -> Result<Vec<u8>, PolicyError> {
    let mut data = Vec::new();
    let read = if path == "-" {
        io::stdin().lock().read_to_end(&mut data).map(|_| ())
    } else {
        std::fs::File::open(path).and_then(|mut f| f.read_to_end(&mut data).map(|_| ()))
    };
    read.map_err(|source| PolicyError::Cache {
        path: path.to_string(),
        source,
    })?;
    Ok(data)
}

fn verifier_config(matches: &ArgMatches) -> Result<VerifierConfig, PolicyError> {
    let state_dir = matches
        .get_one::<String>("state_dir")
        .ok_or_else(|| PolicyError::Configuration("--state-dir is required".to_string()))?;
    let mut config = VerifierConfig::new(PathBuf::from(state_dir))
        .with_require_online(matches.get_flag("require_online"));
    if let Some(secs) = matches.get_one::<u64>("update_interval") {
        config = config.with_update_interval(Duration::from_secs(*secs));
    }
    Ok(config)
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted");
            trigger.cancel();
        }
    });
    token
}

async fn verify_artifact(
    config: VerifierConfig,
    matches: &ArgMatches,
) -> Result<(), PolicyError> {
    let artifact = matches
        .get_one::<String>("artifact")
        .ok_or_else(|| PolicyError::Configuration("missing artifact".to_string()))?;
    let bundle_file = matches
        .get_one::<String>("bundle")
        .ok_or_else(|| PolicyError::Configuration("--bundle is required".to_string()))?;

    let digest = format!("sha256:{}", hex::encode(Sha256::digest(read_input(artifact)?)));
    let bundle = read_input(bundle_file)?;
    log::debug!("verifying {artifact} ({digest}) with bundle {bundle_file}");

    let verifier = Verifier::new(config).await?;
    let info = verifier
        .verify_artifact(&interrupt_token(), &digest, &bundle)
        .await?;

    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| PolicyError::Internal(format!("encoding result: {e}")))?;
    println!("{json}");
    println!("{}", info.name());
    Ok(())
}

async fn show_status(config: VerifierConfig) -> Result<(), PolicyError> {
    let provider = TrustRootProvider::new(config.trust_root_config()).await?;
    let outcome = provider.trusted_root(&interrupt_token()).await;
    let status = provider.status();
    provider.shutdown();

    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| PolicyError::Internal(format!("encoding status: {e}")))?;
    println!("{json}");
    let (root, _) = outcome.map_err(PolicyError::TrustUnavailable)?;
    println!(
        "Trusted root: {} certificate authorities, {} transparency logs, {} CT logs",
        root.certificate_authorities.len(),
        root.tlogs.len(),
        root.ctlogs.len()
    );
    Ok(())
}

fn start() -> Result<(), PolicyError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Show debug output"),
        )
        .arg(
            Arg::new("state_dir")
                .long("state-dir")
                .value_name("DIR")
                .global(true)
                .help("Directory for cached trust metadata (required)"),
        )
        .arg(
            Arg::new("require_online")
                .long("require-online")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Always fetch trust metadata from the network"),
        )
        .arg(
            Arg::new("update_interval")
                .long("update-interval")
                .value_name("SECONDS")
                .global(true)
                .value_parser(clap::value_parser!(u64))
                .help("Refresh trust metadata periodically (0 disables)"),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit JSON audit events on stderr"),
        )
        .arg(
            Arg::new("audit-file")
                .long("audit-file")
                .value_name("FILE")
                .global(true)
                .help("Append JSON audit events to a file"),
        )
        .subcommand(
            Command::new("artifact")
                .about("Verify the provenance signature of a file")
                .arg(
                    Arg::new("artifact")
                        .value_name("FILE")
                        .required(true)
                        .help("Artifact to verify, or - for stdin"),
                )
                .arg(
                    Arg::new("bundle")
                        .long("bundle")
                        .value_name("FILE")
                        .required(true)
                        .help("Sigstore bundle (JSON)"),
                ),
        )
        .subcommand(Command::new("status").about("Show the state of the cached trust root"))
        .get_matches();

    // Global flags are visible from the subcommand whichever side they were given on.
    let (command, args) = match matches.subcommand() {
        Some((name, sub)) => (name, sub),
        None => ("", &matches),
    };
    let debug = args.get_flag("debug");
    let audit_enabled = args.get_flag("audit");
    let audit_file = args.get_one::<String>("audit-file").map(|s| s.as_str());

    env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if audit_enabled || audit_file.is_some() {
        let destination = match audit_file {
            Some(path) => LogDestination::File(path.to_string()),
            None => LogDestination::Stderr,
        };
        audit::init(AuditConfig {
            destination,
            ..AuditConfig::default()
        })?;
    }

    let config = verifier_config(args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| PolicyError::Internal(format!("starting runtime: {e}")))?;

    match command {
        "artifact" => runtime.block_on(verify_artifact(config, args)),
        "status" => runtime.block_on(show_status(config)),
        _ => Err(PolicyError::Configuration(
            "no subcommand given, see --help".to_string(),
        )),
    }
}

fn main() -> Result<(), PolicyError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
