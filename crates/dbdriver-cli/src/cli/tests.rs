use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

#[test]
fn cli_parse_config() {
    let cli = parse(&["dbdriver", "config"]);
    assert!(matches!(cli.command, CliCommand::Config));
    assert!(cli.config.is_none());
}

#[test]
fn cli_parse_global_config_path() {
    let cli = parse(&["dbdriver", "config", "--config", "/tmp/dbdriver.toml"]);
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/dbdriver.toml")));
}

#[test]
fn cli_parse_stress_defaults() {
    match parse(&["dbdriver", "stress"]).command {
        CliCommand::Stress {
            workers,
            operations,
            failure_rate,
            pool_size,
            seed,
            non_idempotent,
        } => {
            assert_eq!(workers, 16);
            assert_eq!(operations, 100);
            assert!((failure_rate - 0.1).abs() < f64::EPSILON);
            assert_eq!(pool_size, None);
            assert_eq!(seed, None);
            assert!(!non_idempotent);
        }
        _ => panic!("expected Stress"),
    }
}

#[test]
fn cli_parse_stress_all_flags() {
    let args = [
        "dbdriver",
        "stress",
        "--workers",
        "4",
        "--operations",
        "10",
        "--failure-rate",
        "0.5",
        "--pool-size",
        "2",
        "--seed",
        "9",
        "--non-idempotent",
    ];
    match parse(&args).command {
        CliCommand::Stress {
            workers,
            operations,
            failure_rate,
            pool_size,
            seed,
            non_idempotent,
        } => {
            assert_eq!(workers, 4);
            assert_eq!(operations, 10);
            assert!((failure_rate - 0.5).abs() < f64::EPSILON);
            assert_eq!(pool_size, Some(2));
            assert_eq!(seed, Some(9));
            assert!(non_idempotent);
        }
        _ => panic!("expected Stress"),
    }
}

#[test]
fn cli_parse_unknown_subcommand_fails() {
    assert!(Cli::try_parse_from(["dbdriver", "add", "x"]).is_err());
}

#[test]
fn cli_parse_stress_rejects_non_numeric_workers() {
    assert!(Cli::try_parse_from(["dbdriver", "stress", "--workers", "many"]).is_err());
}

#[tokio::test]
async fn stress_rejects_out_of_range_failure_rate() {
    let opts = StressOptions {
        workers: 1,
        operations: 1,
        failure_rate: 1.5,
        pool_size: None,
        seed: None,
        idempotent: true,
    };
    let err = run_stress(&DriverConfig::default(), opts).await.unwrap_err();
    assert!(err.to_string().contains("failure-rate"));
}

#[tokio::test]
async fn stress_small_run_completes() {
    let opts = StressOptions {
        workers: 2,
        operations: 5,
        failure_rate: 0.0,
        pool_size: Some(2),
        seed: Some(1),
        idempotent: true,
    };
    run_stress(&DriverConfig::default(), opts).await.unwrap();
}
