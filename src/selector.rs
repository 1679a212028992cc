//! Resource selection after the provider returns its list.

use std::time::Duration;

use crate::errors::ConnectError;
use crate::models::ConnectableResource;

/// What the coordinator should do on entering `PagesReady`.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionPlan {
    /// Nothing to connect; the session fails with `NoEligibleResources`.
    Empty,
    /// Exactly one resource: select it after a short delay so the UI can
    /// render the list before moving on.
    AutoSelect {
        resource: ConnectableResource,
        after: Duration,
    },
    /// The user has to pick; there is no default.
    AwaitChoice { count: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceSelector {
    auto_select_delay: Duration,
}

impl ResourceSelector {
    pub fn new(auto_select_delay: Duration) -> Self {
        Self { auto_select_delay }
    }

    pub fn plan(&self, resources: &[ConnectableResource]) -> SelectionPlan {
        match resources {
            [] => SelectionPlan::Empty,
            [only] => SelectionPlan::AutoSelect {
                resource: only.clone(),
                after: self.auto_select_delay,
            },
            many => SelectionPlan::AwaitChoice { count: many.len() },
        }
    }

    /// Look up the user's choice among the offered resources.
    pub fn choose(
        resources: &[ConnectableResource],
        external_id: &str,
    ) -> Result<ConnectableResource, ConnectError> {
        resources
            .iter()
            .find(|r| r.external_id == external_id)
            .cloned()
            .ok_or_else(|| ConnectError::ResourceNotFound(external_id.to_string()))
    }
}
