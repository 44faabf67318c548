use std::collections::HashMap;
use std::str::FromStr;

use rusoto_autoscaling::{AutoScalingGroupNamesType, Autoscaling, AutoscalingClient};
use rusoto_core::credential::{AutoRefreshingProvider, DefaultCredentialsProvider};
use rusoto_core::{Client, HttpClient, Region};
use rusoto_ec2::{DescribeInstancesRequest, Ec2, Ec2Client};
use rusoto_sts::{StsAssumeRoleSessionCredentialsProvider, StsClient};
use tokio::runtime::Runtime;

use crate::errors::{Error, Result};

/// Looks up ASG membership and instance addresses.
pub trait Inventory {
    fn region(&self) -> &str;

    fn instance_ids_for_asg(&self, asg_name: &str) -> Result<Vec<String>>;

    /// Maps instance ID to public IP. Instances without one are left out.
    fn public_ips_of_instances(&self, instance_ids: &[String]) -> Result<HashMap<String, String>>;

    fn public_ip_of_instance(&self, instance_id: &str) -> Result<String> {
        let ips = self.public_ips_of_instances(&[instance_id.to_string()])?;
        match ips.get(instance_id) {
            Some(ip) => Ok(ip.clone()),
            None => Err(Error::IpNotFound {
                instance_id: instance_id.to_string(),
                region: self.region().to_string(),
            }),
        }
    }
}

/// `Inventory` backed by the EC2 and Auto Scaling APIs.
pub struct Ec2Inventory {
    region: Region,
    ec2: Ec2Client,
    autoscaling: AutoscalingClient,
    rt: Runtime,
}

impl Ec2Inventory {
    /// Uses the default credential chain.
    pub fn new(region: &str) -> Result<Self> {
        let region = parse_region(region)?;
        let provider = DefaultCredentialsProvider::new().map_err(|e| Error::Client {
            message: format!("failed to load default credentials ({})", e),
        })?;
        Self::with_client(region, Client::new_with(provider, http_client()?))
    }

    /// Uses credentials from assuming `role_arn` through STS.
    pub fn with_assumed_role(region: &str, role_arn: &str, session_name: &str) -> Result<Self> {
        let region = parse_region(region)?;
        let sts = StsClient::new(region.clone());
        let provider = StsAssumeRoleSessionCredentialsProvider::new(
            sts,
            role_arn.to_string(),
            session_name.to_string(),
            None,
            None,
            None,
            None,
        );
        let provider = AutoRefreshingProvider::new(provider).map_err(|e| Error::Client {
            message: format!("failed to assume role {} ({})", role_arn, e),
        })?;
        Self::with_client(region, Client::new_with(provider, http_client()?))
    }

    fn with_client(region: Region, client: Client) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        log::info!("created EC2 inventory in region {}", region.name());
        Ok(Ec2Inventory {
            ec2: Ec2Client::new_with_client(client.clone(), region.clone()),
            autoscaling: AutoscalingClient::new_with_client(client, region.clone()),
            region,
            rt,
        })
    }
}

impl Inventory for Ec2Inventory {
    fn region(&self) -> &str {
        self.region.name()
    }

    fn instance_ids_for_asg(&self, asg_name: &str) -> Result<Vec<String>> {
        log::info!("looking up instances in ASG '{}'", asg_name);
        let req = AutoScalingGroupNamesType {
            auto_scaling_group_names: Some(vec![asg_name.to_string()]),
            ..Default::default()
        };
        let resp = self
            .rt
            .block_on(self.autoscaling.describe_auto_scaling_groups(req))
            .map_err(|e| Error::Api {
                message: format!("failed describe_auto_scaling_groups {:?}", e),
            })?;

        let group = match resp.auto_scaling_groups.into_iter().next() {
            Some(g) => g,
            None => {
                return Err(Error::AsgNotFound {
                    asg_name: asg_name.to_string(),
                    region: self.region().to_string(),
                })
            }
        };

        let ids: Vec<String> = group
            .instances
            .unwrap_or_default()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        log::info!("found {} instance(s) in ASG '{}'", ids.len(), asg_name);
        Ok(ids)
    }

    fn public_ips_of_instances(&self, instance_ids: &[String]) -> Result<HashMap<String, String>> {
        let mut ips = HashMap::new();
        if instance_ids.is_empty() {
            return Ok(ips);
        }

        let req = DescribeInstancesRequest {
            instance_ids: Some(instance_ids.to_vec()),
            ..Default::default()
        };
        let resp = self
            .rt
            .block_on(self.ec2.describe_instances(req))
            .map_err(|e| Error::Api {
                message: format!("failed describe_instances {:?}", e),
            })?;

        for reservation in resp.reservations.unwrap_or_default() {
            for instance in reservation.instances.unwrap_or_default() {
                match (instance.instance_id, instance.public_ip_address) {
                    (Some(id), Some(ip)) => {
                        log::debug!("instance {} has public IP {}", id, ip);
                        ips.insert(id, ip);
                    }
                    (Some(id), None) => log::warn!("instance {} has no public IP", id),
                    _ => {}
                }
            }
        }
        Ok(ips)
    }
}

fn parse_region(region: &str) -> Result<Region> {
    Region::from_str(region).map_err(|e| Error::Client {
        message: format!("invalid region '{}' ({})", region, e),
    })
}

fn http_client() -> Result<HttpClient> {
    HttpClient::new().map_err(|e| Error::Client {
        message: format!("failed to create TLS client ({})", e),
    })
}
