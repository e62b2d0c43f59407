use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::cluster_args::ClusterRefArgs;
use crate::config::cluster_args::LaunchArgs;
use crate::config::jobs::SubmitArgs;
use crate::config::jobs::WatchJobsArgs;
use crate::config::keepalive::KeepaliveArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision RBAC and node pods for a cluster and wait until it is up
    Launch(LaunchArgs),
    /// Show the node pods of a cluster
    Status(ClusterRefArgs),
    /// Delete the node pods and head Service of a cluster
    Down(ClusterRefArgs),
    /// Queue a job, optionally following it until it finishes
    Submit(Box<SubmitArgs>),
    /// Follow every podfleet job in a namespace and resubmit preempted ones
    #[command(name = "watch-jobs")]
    WatchJobs(WatchJobsArgs),
    /// Keep a node pod alive while its task logs are being read (runs inside the pod)
    Keepalive(KeepaliveArgs),
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_keepalive_as_written_by_the_startup_script() {
        let cli = Cli::try_parse_from([
            "podfleet",
            "keepalive",
            "--log-pattern",
            "/root/podfleet_logs/*/tasks/*.log",
            "--ready-file",
            "/tmp/podfleet/keepalive.ready",
        ])
        .unwrap();
        let Commands::Keepalive(args) = cli.command else {
            panic!("expected keepalive");
        };
        assert_eq!(args.log_pattern, "/root/podfleet_logs/*/tasks/*.log");
        assert_eq!(args.poll_interval_secs, 5);
        assert_eq!(args.grace_polls, 1);
    }

    #[test]
    fn parses_submit_with_labels_and_command() {
        let cli = Cli::try_parse_from([
            "podfleet",
            "submit",
            "--name",
            "train",
            "--queue",
            "user-queue",
            "--priority-class",
            "low-priority",
            "--image",
            "python:3.11",
            "--cpus",
            "6",
            "--memory",
            "2",
            "--label",
            "team=data",
            "--",
            "python",
            "train.py",
        ])
        .unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        let request = args.job_request();
        assert_eq!(request.namespace, "default");
        assert_eq!(request.command, vec!["python", "train.py"]);
        assert_eq!(request.labels["team"], "data");
        assert!(!args.watch);
    }

    #[test]
    fn rejects_malformed_labels() {
        let result = Cli::try_parse_from([
            "podfleet",
            "submit",
            "--name",
            "train",
            "--queue",
            "q",
            "--priority-class",
            "p",
            "--image",
            "i",
            "--cpus",
            "1",
            "--memory",
            "1",
            "--label",
            "no-equals-sign",
        ]);
        assert!(result.is_err());
    }
}
