//! Applying buffered actions.

use async_trait::async_trait;
use cadeploy_core::{ChangeImageOptions, CreateOptions, DeleteOptions, UpdateOptions};
use cadeploy_manager::DeploymentManager;
use serde_json::{Value, json};

use crate::action::Action;
use crate::error::{QueueError, QueueResult};

/// Runs one action on behalf of the CA owned by `owner`, returning the
/// reply payload.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, owner: &str, action: &Action) -> QueueResult<Value>;
}

#[async_trait]
impl ActionExecutor for DeploymentManager {
    async fn execute(&self, owner: &str, action: &Action) -> QueueResult<Value> {
        let id = action.qualified_id(owner)?;
        match action {
            Action::CreateApp {
                image,
                is_untrusted,
                plan,
                cdn,
                env,
                ..
            } => {
                let mut opts = CreateOptions::new(id, image.clone(), *is_untrusted, plan.clone());
                opts.cdn = cdn.clone();
                opts.env = env.clone();
                let id = self.create_app(&opts).await?;
                Ok(json!({ "id": id }))
            }
            Action::DeleteApp { keep_data, .. } => {
                let report = self
                    .delete_app(&DeleteOptions {
                        id,
                        timestamp: None,
                        keep_data: *keep_data,
                    })
                    .await?;
                if !report.is_clean() {
                    let failed: Vec<String> = report.failures().map(|s| s.name.clone()).collect();
                    return Err(QueueError::Rejected(format!(
                        "partial delete, failed: {}",
                        failed.join(", ")
                    )));
                }
                Ok(serde_json::to_value(report)?)
            }
            Action::RestartApp { .. } => {
                self.restart_app(&id).await?;
                Ok(json!({ "id": id }))
            }
            Action::FlexApp {
                plan,
                number_of_cas,
                ..
            } => {
                let outcome = self
                    .update_app(&UpdateOptions {
                        id: id.clone(),
                        plan: plan.clone(),
                        number_of_cas: *number_of_cas,
                        current_props: None,
                    })
                    .await?;
                Ok(json!({
                    "id": id,
                    "instances": outcome.props.app.instances,
                    "is_incubator": outcome.props.app.is_incubator,
                }))
            }
            Action::ChangeImage { image, .. } => {
                let props = self
                    .change_image(&ChangeImageOptions {
                        id: id.clone(),
                        image: image.clone(),
                        current_props: None,
                    })
                    .await?;
                Ok(json!({ "id": id, "image": props.app.image }))
            }
        }
    }
}
