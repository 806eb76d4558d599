use serde::Serialize;

use crate::dispatch::{SchedulerApi, StringPair, TaskRequest};
use crate::error::DispatchError;

pub const SHARD_INDEX_ENV: &str = "GTEST_SHARD_INDEX";
pub const TOTAL_SHARDS_ENV: &str = "GTEST_TOTAL_SHARDS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredShard {
    pub shard_index: usize,
    pub task_id: String,
    pub view_url: String,
}

/// The request for one shard out of `total`.
///
/// With more than one shard, the shard index and count are passed through the
/// environment and the name gets a `:index:total` suffix.
pub fn shard_request(request: &TaskRequest, index: usize, total: usize) -> TaskRequest {
    let mut request = request.clone();
    if total <= 1 {
        return request;
    }

    let env = &mut request.properties.env;
    env.retain(|pair| pair.key != SHARD_INDEX_ENV && pair.key != TOTAL_SHARDS_ENV);
    env.push(StringPair::new(SHARD_INDEX_ENV, index.to_string()));
    env.push(StringPair::new(TOTAL_SHARDS_ENV, total.to_string()));

    request.name = format!("{}:{index}:{total}", request.name);
    request
}

/// Submits `shards` copies of `request`.
///
/// All or nothing: when one shard can't be triggered, the shards triggered so
/// far are cancelled (best effort) and the error names the failing shard.
pub fn trigger_shards<S: SchedulerApi + ?Sized>(
    api: &S,
    request: &TaskRequest,
    shards: usize,
) -> Result<Vec<TriggeredShard>, DispatchError> {
    if shards == 0 {
        return Err(DispatchError::Request(
            "at least one shard is required".to_string(),
        ));
    }

    let mut triggered = Vec::with_capacity(shards);

    for index in 0..shards {
        let request = shard_request(request, index, shards);

        match api.new_task(&request) {
            Ok(task_id) => {
                tracing::info!("Triggered {} as {task_id}", request.name);
                triggered.push(TriggeredShard {
                    shard_index: index,
                    view_url: api.view_url(&task_id),
                    task_id,
                });
            }
            Err(source) => {
                tracing::error!("Failed to trigger {}: {source}", request.name);

                for shard in &triggered {
                    if let Err(err) = api.cancel(&shard.task_id) {
                        tracing::warn!("Couldn't cancel {}: {err}", shard.task_id);
                    }
                }

                return Err(DispatchError::Trigger {
                    shard_index: index,
                    source,
                });
            }
        }
    }

    Ok(triggered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dispatch::{Swarming, TaskProperties};
    use crate::net::fake::FakeServer;

    fn request() -> TaskRequest {
        let mut properties = TaskProperties::default();
        properties.env.push(StringPair::new(SHARD_INDEX_ENV, "9"));
        properties.env.push(StringPair::new("LANG", "C"));
        TaskRequest::new("unit_tests", properties)
    }

    #[test]
    fn test_shard_request() {
        let single = shard_request(&request(), 0, 1);
        assert_eq!(single.name, "unit_tests");
        assert_eq!(single.properties.env.len(), 2);

        let shard = shard_request(&request(), 1, 3);
        assert_eq!(shard.name, "unit_tests:1:3");
        assert_eq!(
            shard.properties.env,
            vec![
                StringPair::new("LANG", "C"),
                StringPair::new(SHARD_INDEX_ENV, "1"),
                StringPair::new(TOTAL_SHARDS_ENV, "3"),
            ]
        );
    }

    #[test]
    fn test_trigger_all_shards() {
        let fake = FakeServer::new();
        let api = Swarming::new("https://swarm.test/", fake.clone());

        let shards = trigger_shards(&api, &request(), 3).unwrap();

        let indices: Vec<usize> = shards.iter().map(|s| s.shard_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(shards[0].view_url.starts_with("https://swarm.test/user/task/"));
        assert_eq!(fake.count("tasks/new"), 3);
    }

    #[test]
    fn test_failed_shard_cancels_the_others() {
        let fake = FakeServer::new();
        fake.fail_trigger(2);
        let api = Swarming::new("https://swarm.test", Arc::clone(&fake));

        let err = trigger_shards(&api, &request(), 4).unwrap_err();
        assert!(matches!(err, DispatchError::Trigger { shard_index: 2, .. }));

        assert_eq!(fake.canceled().len(), 2);
        assert_eq!(fake.count("tasks/new"), 3);
    }

    #[test]
    fn test_zero_shards() {
        let fake = FakeServer::new();
        let api = Swarming::new("https://swarm.test", fake);
        assert!(matches!(
            trigger_shards(&api, &request(), 0),
            Err(DispatchError::Request(_))
        ));
    }
}
