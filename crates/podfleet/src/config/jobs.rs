use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;

use crate::config::cluster_args::KubeArgs;
use crate::domain::jobs::JobRequest;
use crate::domain::jobs::ResubmitPolicy;

#[derive(Parser, Clone, Debug)]
pub struct ControllerArgs {
    #[arg(
        long,
        default_value = "10",
        help = "Seconds between full resyncs of job state, on top of watch events"
    )]
    pub resync_secs: u64,

    #[arg(
        long,
        help = "Give up on a job after this many attempts (first submission included); unlimited by default"
    )]
    pub max_attempts: Option<u32>,
}

impl ControllerArgs {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }

    pub fn policy(&self) -> ResubmitPolicy {
        ResubmitPolicy {
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct SubmitArgs {
    #[arg(long, help = "Job name, reused by every resubmission")]
    pub name: String,

    #[arg(
        long,
        short = 'n',
        env = "PODFLEET_NAMESPACE",
        default_value = "default",
        help = "Namespace to submit into"
    )]
    pub namespace: String,

    #[arg(long, env = "PODFLEET_QUEUE", help = "Local queue to submit to")]
    pub queue: String,

    #[arg(long, env = "PODFLEET_PRIORITY_CLASS", help = "Workload priority class")]
    pub priority_class: String,

    #[arg(long, help = "Container image")]
    pub image: String,

    #[arg(long, help = "CPUs requested")]
    pub cpus: f64,

    #[arg(long, help = "Memory requested in GB")]
    pub memory: f64,

    #[arg(
        long = "label",
        value_parser = parse_label,
        help = "Extra pod label as key=value, repeatable"
    )]
    pub labels: Vec<(String, String)>,

    #[arg(long, help = "Stay attached and resubmit the job if it gets preempted")]
    pub watch: bool,

    #[command(flatten)]
    pub controller: ControllerArgs,

    #[command(flatten)]
    pub kube: KubeArgs,

    #[arg(last = true, help = "Command to run in the container")]
    pub command: Vec<String>,
}

impl SubmitArgs {
    pub fn job_request(&self) -> JobRequest {
        JobRequest {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            queue_name: self.queue.clone(),
            priority_class: self.priority_class.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            cpus: self.cpus,
            memory_gb: self.memory,
            labels: self.labels.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct WatchJobsArgs {
    #[arg(
        long,
        short = 'n',
        env = "PODFLEET_NAMESPACE",
        default_value = "default",
        help = "Namespace whose jobs are followed"
    )]
    pub namespace: String,

    #[command(flatten)]
    pub controller: ControllerArgs,

    #[command(flatten)]
    pub kube: KubeArgs,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{s}`")),
    }
}
