use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::domain::cluster_api::KubernetesError;

/// Build a client from an explicit kubeconfig file, the default kubeconfig
/// or the in-cluster service account, in that order. `context` selects a
/// kubeconfig context other than the current one.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
) -> Result<Client, Report<KubernetesError>> {
    let options = KubeConfigOptions {
        context: context.clone(),
        ..Default::default()
    };
    let config = match (kubeconfig, context) {
        (Some(kubeconfig_path), _) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?
        }
        (None, Some(context)) => Config::from_kubeconfig(&options).await.change_context(
            KubernetesError::ConnectionFailed {
                message: format!("Failed to load kubeconfig context {context}"),
            },
        )?,
        // in-cluster or ~/.kube/config
        (None, None) => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to infer Kubernetes configuration".to_string(),
            })?,
    };

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })
}
