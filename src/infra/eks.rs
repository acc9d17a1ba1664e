use crate::config::{ConfigurationError, EksConfigInput};
use crate::infra::{InfraError, ResourceGraph, ResourceRef};
use serde_json::{json, Map, Value};
use tracing::info;

/// Thumbprint of the root CA behind every EKS OIDC issuer.
pub const AWS_ROOT_CA_THUMBPRINT: &str = "9e99a48a9960b14926bb7f3b02e22da2b0ab7280";

const AWS_MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";
const CLUSTER_POLICY_ARNS: [&str; 2] = [
    "arn:aws:iam::aws:policy/AmazonEKSServicePolicy",
    "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
];
const NODE_GROUP_POLICY_ARNS: [&str; 3] = [
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
];
const CLUSTER_LOG_TYPES: [&str; 5] = [
    "api",
    "audit",
    "authenticator",
    "controllerManager",
    "scheduler",
];

#[derive(Clone, Debug, PartialEq)]
pub struct EksOutputs {
    pub cluster: ResourceRef,
    pub node_group_role: ResourceRef,
    pub node_groups: Vec<ResourceRef>,
    pub oidc_provider: ResourceRef,
    pub cluster_autoscaler_role: ResourceRef,
}

fn service_assume_role_policy(version: &str, service: &str) -> Value {
    json!({
        "Version": version,
        "Statement": [{
            "Sid": "",
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// Trust policy letting the `namespace/service_account` Kubernetes service account assume a role
/// through the cluster OIDC provider. IAM condition keys name the issuer without its scheme, so a
/// graph reference to the provider url has to be trimmed at resolution time.
pub fn irsa_assume_role_policy(
    oidc_provider_arn: &str,
    oidc_provider_url: &str,
    namespace: &str,
    service_account: &str,
) -> Value {
    let issuer = oidc_provider_url
        .strip_prefix("https://")
        .unwrap_or(oidc_provider_url);
    let mut string_equals = Map::new();
    string_equals.insert(
        format!("{issuer}:sub"),
        Value::from(format!(
            "system:serviceaccount:{namespace}:{service_account}"
        )),
    );

    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Effect": "Allow",
            "Principal": { "Federated": oidc_provider_arn },
            "Condition": { "StringEquals": string_equals },
        }],
    })
}

fn cluster_autoscaler_policy(cluster_name: &str) -> Value {
    let mut string_equals = Map::new();
    string_equals.insert(
        format!("autoscaling:ResourceTag/kubernetes.io/cluster/{cluster_name}"),
        Value::from("owned"),
    );

    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Action": [
                    "autoscaling:DescribeAutoScalingGroups",
                    "autoscaling:DescribeAutoScalingInstances",
                    "autoscaling:DescribeLaunchConfigurations",
                    "autoscaling:DescribeTags",
                    "ec2:DescribeLaunchTemplateVersions",
                    "ec2:DescribeInstanceTypes",
                ],
                "Effect": "Allow",
                "Resource": "*",
            },
            {
                "Action": [
                    "autoscaling:SetDesiredCapacity",
                    "autoscaling:TerminateInstanceInAutoScalingGroup",
                    "autoscaling:UpdateAutoScalingGroup",
                ],
                "Effect": "Allow",
                "Resource": "*",
                "Condition": { "StringEquals": string_equals },
            },
        ],
    })
}

pub struct EksPlanner<'a> {
    cluster_name: &'a str,
    oidc_thumbprint: &'a str,
}

impl<'a> EksPlanner<'a> {
    pub fn new(cluster_name: &'a str) -> Self {
        EksPlanner {
            cluster_name,
            oidc_thumbprint: AWS_ROOT_CA_THUMBPRINT,
        }
    }

    pub fn with_oidc_thumbprint(mut self, oidc_thumbprint: &'a str) -> Self {
        self.oidc_thumbprint = oidc_thumbprint;
        self
    }

    fn attach_policies(
        &self,
        graph: &mut ResourceGraph,
        prefix: &str,
        role: &ResourceRef,
        policy_arns: &[&str],
    ) -> Result<(), InfraError> {
        for &policy_arn in policy_arns {
            let policy_name = policy_arn
                .strip_prefix(AWS_MANAGED_POLICY_PREFIX)
                .unwrap_or(policy_arn);
            graph.register(
                &format!("{prefix}-{policy_name}-policy-attachment"),
                "aws:iam/rolePolicyAttachment:RolePolicyAttachment",
                json!({
                    "role": role.output("name"),
                    "policyArn": policy_arn,
                }),
                &[],
            )?;
        }
        Ok(())
    }

    /// Plans the cluster, its node groups and the cluster autoscaler IRSA role, spread over
    /// `subnet_ids`.
    pub fn plan(
        &self,
        graph: &mut ResourceGraph,
        config: &EksConfigInput,
        subnet_ids: &[String],
    ) -> Result<EksOutputs, InfraError> {
        if subnet_ids.is_empty() {
            return Err(ConfigurationError::NoSubnets.into());
        }
        let cluster_name = self.cluster_name;

        let cluster_role = graph.register(
            "eks-iam-role",
            "aws:iam/role:Role",
            json!({
                "assumeRolePolicy": service_assume_role_policy("2008-10-17", "eks.amazonaws.com"),
            }),
            &[],
        )?;
        self.attach_policies(graph, "eks", &cluster_role, &CLUSTER_POLICY_ARNS)?;

        let node_group_role = graph.register(
            "nodegroup-iam-role",
            "aws:iam/role:Role",
            json!({
                "assumeRolePolicy": service_assume_role_policy("2012-10-17", "ec2.amazonaws.com"),
            }),
            &[],
        )?;
        self.attach_policies(graph, "nodegroup", &node_group_role, &NODE_GROUP_POLICY_ARNS)?;

        let cluster = graph.register(
            "eks-cluster",
            "aws:eks/cluster:Cluster",
            json!({
                "name": cluster_name,
                "version": config.k8s_version,
                "roleArn": cluster_role.arn(),
                "enabledClusterLogTypes": CLUSTER_LOG_TYPES,
                "vpcConfig": {
                    "subnetIds": subnet_ids,
                    "endpointPublicAccess": true,
                    "publicAccessCidrs": ["0.0.0.0/0"],
                },
            }),
            &[],
        )?;

        let mut node_groups = Vec::with_capacity(config.node_groups.len());
        for node_group_config in &config.node_groups {
            let node_group = graph.register(
                &format!("node-group-{}", node_group_config.name),
                "aws:eks/nodeGroup:NodeGroup",
                json!({
                    "clusterName": cluster.output("name"),
                    "nodeGroupNamePrefix": node_group_config.name,
                    "version": config.node_group_version(),
                    "nodeRoleArn": node_group_role.arn(),
                    "instanceTypes": node_group_config.instance_types,
                    "subnetIds": subnet_ids,
                    "scalingConfig": {
                        "desiredSize": node_group_config.desired_size,
                        "maxSize": node_group_config.max_size,
                        "minSize": node_group_config.min_size,
                    },
                }),
                &[],
            )?;
            // the cluster autoscaler owns the desired size once the node group exists
            graph.ignore_changes(&node_group, &["scalingConfig.desiredSize"]);
            node_groups.push(node_group);
        }

        let oidc_provider = graph.register(
            "eks-oidc-provider",
            "aws:iam/openIdConnectProvider:OpenIdConnectProvider",
            json!({
                "clientIdLists": ["sts.amazonaws.com"],
                "thumbprintLists": [self.oidc_thumbprint],
                "url": cluster.output("identities[0].oidcs[0].issuer"),
            }),
            &[],
        )?;

        let cluster_autoscaler_policy = graph.register(
            "cluster-autoscaler-policy",
            "aws:iam/policy:Policy",
            json!({
                "name": format!("cluster-autoscaler-policy-{cluster_name}"),
                "description": format!("cluster autoscaler policy for {cluster_name} eks cluster"),
                "policy": cluster_autoscaler_policy(cluster_name),
            }),
            &[],
        )?;
        let cluster_autoscaler_role = graph.register(
            "cluster-autoscaler-role",
            "aws:iam/role:Role",
            json!({
                "name": format!("cluster-autoscaler-role-{cluster_name}"),
                "assumeRolePolicy": irsa_assume_role_policy(
                    &oidc_provider.arn(),
                    &oidc_provider.output_trim_prefix("url", "https://"),
                    config.cluster_autoscaler_namespace(),
                    config.cluster_autoscaler_service_account(),
                ),
            }),
            &[],
        )?;
        graph.register(
            "cluster-autoscaler-role-policy-attachment",
            "aws:iam/rolePolicyAttachment:RolePolicyAttachment",
            json!({
                "role": cluster_autoscaler_role.output("name"),
                "policyArn": cluster_autoscaler_policy.arn(),
            }),
            &[],
        )?;

        graph.export("clusterName", json!(cluster.output("name")));
        graph.export("nodeGroupRoleArn", json!(node_group_role.arn()));
        graph.export("oidcProviderArn", json!(oidc_provider.arn()));
        graph.export(
            "clusterAutoscalerRoleArn",
            json!(cluster_autoscaler_role.arn()),
        );

        info!(
            "Planned EKS cluster `{cluster_name}` ({}) with {} node group(s)",
            config.k8s_version,
            node_groups.len()
        );
        Ok(EksOutputs {
            cluster,
            node_group_role,
            node_groups,
            oidc_provider,
            cluster_autoscaler_role,
        })
    }
}
