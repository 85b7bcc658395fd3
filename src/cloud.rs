//! Cloud instance metadata bootstrap: best-effort EC2/GCE user-data
//! fetches applied onto `AgentConfig`, plus the post-fetch loopback route
//! that keeps the tested browser from reaching the metadata service.
//! Generalizes the teacher's `load_from_ec2`/`load_from_gce` startup
//! probes, which ran once before the dispatch loop started.

use crate::config::{AgentConfig, SchedulerConfig};
use crate::driver::HostOs;
use std::time::Duration;
use tracing::{debug, warn};

const EC2_USER_DATA_URL: &str = "http://169.254.169.254/latest/user-data";
const EC2_INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";
const EC2_AZ_URL: &str = "http://169.254.169.254/latest/meta-data/placement/availability-zone";
const GCE_USER_DATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/wpt_data";
const GCE_INSTANCE_ID_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/id";
const GCE_ZONE_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/zone";

/// Identity learned from a successful cloud metadata fetch, used to
/// enrich `getwork.php`'s `ec2`/`ec2zone` query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: Option<String>,
    pub zone: Option<String>,
}

/// Fetch EC2 user-data and instance identity, applying recognized
/// user-data keys onto `config`. Every network call is independently
/// best-effort: failures are logged at debug level and never propagated.
/// Installs the metadata blackhole route once any fetch succeeds.
pub async fn load_from_ec2(config: &mut AgentConfig, host: &dyn HostOs) -> InstanceIdentity {
    let client = reqwest::Client::new();
    let mut identity = InstanceIdentity::default();

    match fetch_text(&client, EC2_USER_DATA_URL, None).await {
        Ok(body) => apply_user_data(config, &body),
        Err(err) => debug!(%err, "EC2 user-data fetch failed"),
    }

    identity.instance_id = fetch_text(&client, EC2_INSTANCE_ID_URL, None).await.ok();
    identity.zone = fetch_text(&client, EC2_AZ_URL, None).await.ok();

    if identity.instance_id.is_some() || identity.zone.is_some() {
        if let Err(err) = host.install_metadata_blackhole_route().await {
            warn!(%err, "failed to install metadata blackhole route");
        }
    }
    identity
}

/// GCE counterpart of `load_from_ec2`. Zone comes back as a full resource
/// path (`projects/123/zones/us-central1-a`); only the trailing segment is
/// kept. When no explicit location was configured, derives one of the form
/// `gce-us-central1` from the zone.
pub async fn load_from_gce(config: &mut AgentConfig, host: &dyn HostOs) -> InstanceIdentity {
    let client = reqwest::Client::new();
    let mut identity = InstanceIdentity::default();

    match fetch_text(&client, GCE_USER_DATA_URL, Some("Google")).await {
        Ok(body) => apply_user_data(config, &body),
        Err(err) => debug!(%err, "GCE user-data fetch failed"),
    }

    identity.instance_id = fetch_text(&client, GCE_INSTANCE_ID_URL, Some("Google")).await.ok();

    if let Ok(zone_path) = fetch_text(&client, GCE_ZONE_URL, Some("Google")).await {
        let zone = zone_path.rsplit('/').next().unwrap_or(&zone_path).to_string();
        if config.test_locations == vec!["default".to_string()] {
            config.location = format!("gce-{}", zone.trim_end_matches(|c: char| c.is_ascii_lowercase()));
        }
        identity.zone = Some(zone);
    }

    if identity.instance_id.is_some() || identity.zone.is_some() {
        if let Err(err) = host.install_metadata_blackhole_route().await {
            warn!(%err, "failed to install metadata blackhole route");
        }
    }
    identity
}

async fn fetch_text(
    client: &reqwest::Client,
    url: &str,
    metadata_flavor: Option<&str>,
) -> Result<String, reqwest::Error> {
    let mut request = client.get(url).timeout(Duration::from_secs(30));
    if let Some(flavor) = metadata_flavor {
        request = request.header("Metadata-Flavor", flavor);
    }
    request.send().await?.error_for_status()?.text().await
}

/// Parse whitespace-separated `key=value` user-data and apply the
/// recognized keys onto `config`. Unknown keys and malformed pairs are
/// silently ignored.
pub fn apply_user_data(config: &mut AgentConfig, user_data: &str) {
    let mut scheduler_url = config.scheduler.as_ref().map(|s| s.url.clone());
    let mut scheduler_salt = config.scheduler.as_ref().map(|s| s.salt.clone());
    let mut scheduler_node = config.scheduler.as_ref().map(|s| s.node.clone());

    for option in user_data.split_whitespace() {
        let Some((key, value)) = option.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if value.is_empty() {
            continue;
        }

        match key {
            "wpt_server" => {
                let server = if value.starts_with("http://") || value.starts_with("https://") {
                    if value.ends_with('/') {
                        format!("{value}work/")
                    } else {
                        format!("{value}/work/")
                    }
                } else {
                    format!("http://{value}/work/")
                };
                config.work_servers = vec![server];
            }
            "wpt_url" => {
                config.work_servers = value.split(',').map(|s| s.to_string()).collect();
            }
            "wpt_loc" | "wpt_location" => {
                config.test_locations = value.split(',').map(|s| s.to_string()).collect();
                if let Some(first) = config.test_locations.first() {
                    config.location = first.clone();
                }
            }
            "wpt_key" => config.key = Some(value.to_string()),
            "wpt_username" => config.auth_username = Some(value.to_string()),
            "wpt_password" => config.auth_password = Some(value.to_string()),
            "wpt_validcertificate" => config.validate_server_certificate = value == "1",
            "wpt_scheduler" => scheduler_url = Some(value.to_string()),
            "wpt_scheduler_salt" => scheduler_salt = Some(value.to_string()),
            "wpt_scheduler_node" => scheduler_node = Some(value.to_string()),
            "wpt_fps" => {
                if let Ok(fps) = value.parse() {
                    config.fps = fps;
                }
            }
            "wpt_timeout" => {}
            _ => {}
        }
    }

    if let (Some(url), Some(salt), Some(node)) = (scheduler_url, scheduler_salt, scheduler_node) {
        config.scheduler = Some(SchedulerConfig { url, salt, node });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wpt_server_without_scheme_gets_http_and_work_suffix() {
        let mut config = AgentConfig::default();
        apply_user_data(&mut config, "wpt_server=agent.example.com");
        assert_eq!(config.work_servers, vec!["http://agent.example.com/work/".to_string()]);
    }

    #[test]
    fn wpt_loc_updates_locations_and_primary() {
        let mut config = AgentConfig::default();
        apply_user_data(&mut config, "wpt_loc=dulles,london");
        assert_eq!(config.test_locations, vec!["dulles".to_string(), "london".to_string()]);
        assert_eq!(config.location, "dulles");
    }

    #[test]
    fn scheduler_triple_only_applies_once_complete() {
        let mut config = AgentConfig::default();
        apply_user_data(&mut config, "wpt_scheduler=https://sched/ wpt_scheduler_salt=abc");
        assert!(config.scheduler.is_none());
        apply_user_data(&mut config, "wpt_scheduler_node=node-1");
        assert!(config.scheduler.is_none());

        let mut config = AgentConfig::default();
        apply_user_data(
            &mut config,
            "wpt_scheduler=https://sched/ wpt_scheduler_salt=abc wpt_scheduler_node=node-1",
        );
        let scheduler = config.scheduler.unwrap();
        assert_eq!(scheduler.url, "https://sched/");
        assert_eq!(scheduler.node, "node-1");
    }

    #[test]
    fn unknown_and_malformed_keys_are_ignored() {
        let mut config = AgentConfig::default();
        apply_user_data(&mut config, "garbage wpt_unknown=1 wpt_key=abc123");
        assert_eq!(config.key, Some("abc123".to_string()));
    }
}
