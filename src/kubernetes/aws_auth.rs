use crate::config::{non_empty, AuthConfigMapInput, IamIdentityInput, SsoRolePermissionSetInput};
use crate::identity::{IdentityError, IdentityResolver};
use crate::kubernetes::arn::{derive_username, strip_path};
use crate::kubernetes::{IamArn, KubernetesError, KubernetesGroupName, KubernetesUserName};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const AWS_AUTH_CONFIG_MAP_NAME: &str = "aws-auth";
pub const AWS_AUTH_CONFIG_MAP_NAMESPACE: &str = "kube-system";
pub const MAP_ROLES_KEY: &str = "mapRoles";
pub const MAP_USERS_KEY: &str = "mapUsers";

const NODE_USERNAME: &str = "system:node:{{EC2PrivateDNSName}}";
const NODE_GROUPS: [&str; 2] = ["system:bootstrappers", "system:nodes"];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KubernetesRole {
    pub iam_role_arn: IamArn,
    pub user_name: KubernetesUserName,
    pub groups: Vec<KubernetesGroupName>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KubernetesUser {
    pub iam_user_arn: IamArn,
    pub user_name: KubernetesUserName,
    pub groups: Vec<KubernetesGroupName>,
}

fn group_names(groups: &[String]) -> Vec<KubernetesGroupName> {
    groups.iter().map(|g| KubernetesGroupName::new(g)).collect()
}

impl KubernetesRole {
    /// Binding letting worker nodes join the cluster.
    pub fn node(node_role_arn: IamArn) -> Self {
        KubernetesRole {
            iam_role_arn: node_role_arn,
            user_name: KubernetesUserName::new(NODE_USERNAME),
            groups: NODE_GROUPS.iter().map(|g| KubernetesGroupName::new(g)).collect(),
        }
    }

    pub fn from_sso(input: &SsoRolePermissionSetInput, discovered_role_arn: &IamArn) -> Self {
        KubernetesRole {
            iam_role_arn: strip_path(discovered_role_arn),
            user_name: KubernetesUserName::new(
                non_empty(&input.username).unwrap_or(input.name.as_str()),
            ),
            groups: group_names(&input.permission_groups),
        }
    }

    pub fn from_iam(input: &IamIdentityInput) -> Self {
        let arn = IamArn::new(&input.arn);
        KubernetesRole {
            iam_role_arn: strip_path(&arn),
            user_name: non_empty(&input.username)
                .map(KubernetesUserName::new)
                .unwrap_or_else(|| derive_username(&arn)),
            groups: group_names(&input.permission_groups),
        }
    }
}

impl KubernetesUser {
    pub fn from_iam(input: &IamIdentityInput) -> Self {
        let arn = IamArn::new(&input.arn);
        KubernetesUser {
            iam_user_arn: strip_path(&arn),
            user_name: non_empty(&input.username)
                .map(KubernetesUserName::new)
                .unwrap_or_else(|| derive_username(&arn)),
            groups: group_names(&input.permission_groups),
        }
    }
}

// field order matches the config map EKS creates, so an import does not see a diff
#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
struct MapRoleConfig {
    groups: Vec<String>,
    rolearn: String,
    username: String,
}

#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
struct MapUserConfig {
    groups: Vec<String>,
    userarn: String,
    username: String,
}

/// Content of the aws-auth config map. The node role binding is always first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsAuth {
    pub roles: Vec<KubernetesRole>,
    pub users: Vec<KubernetesUser>,
}

pub struct AwsAuthBuilder {
    node_role: KubernetesRole,
    initial_import: bool,
    sso_roles: Vec<KubernetesRole>,
    iam_roles: Vec<KubernetesRole>,
    iam_users: Vec<KubernetesUser>,
}

impl AwsAuthBuilder {
    pub fn new(node_role_arn: IamArn, initial_import: bool) -> AwsAuthBuilder {
        AwsAuthBuilder {
            node_role: KubernetesRole::node(node_role_arn),
            initial_import,
            sso_roles: Vec::new(),
            iam_roles: Vec::new(),
            iam_users: Vec::new(),
        }
    }

    pub fn sso_role(&mut self, role: KubernetesRole) -> &mut Self {
        self.sso_roles.push(role);
        self
    }

    pub fn iam_role(&mut self, role: KubernetesRole) -> &mut Self {
        self.iam_roles.push(role);
        self
    }

    pub fn iam_user(&mut self, user: KubernetesUser) -> &mut Self {
        self.iam_users.push(user);
        self
    }

    pub fn build(&self) -> AwsAuth {
        // initial import only keeps what EKS itself put in the config map
        if self.initial_import {
            return AwsAuth {
                roles: vec![self.node_role.clone()],
                users: Vec::new(),
            };
        }

        AwsAuth {
            roles: std::iter::once(&self.node_role)
                .chain(self.sso_roles.iter())
                .chain(self.iam_roles.iter())
                .cloned()
                .collect(),
            users: self.iam_users.clone(),
        }
    }
}

impl AwsAuth {
    /// Resolves every identity of `input`. Any failed lookup aborts the whole build.
    pub async fn resolve(
        input: &AuthConfigMapInput,
        resolver: &IdentityResolver,
    ) -> Result<AwsAuth, IdentityError> {
        input.validate()?;

        let node_role_arn = resolver.resolve_node_role(&input.node_role_source()?).await?;
        let mut builder = AwsAuthBuilder::new(node_role_arn, input.initial_import);

        if input.initial_import {
            info!("Initial import mode, only the node group role is mapped");
            return Ok(builder.build());
        }

        for sso_role in &input.sso_roles {
            let discovered_role_arn = resolver.resolve_sso_role(&sso_role.name).await?;
            builder.sso_role(KubernetesRole::from_sso(sso_role, &discovered_role_arn));
        }
        for iam_role in &input.iam_roles {
            builder.iam_role(KubernetesRole::from_iam(iam_role));
        }
        for iam_user in &input.iam_users {
            builder.iam_user(KubernetesUser::from_iam(iam_user));
        }

        Ok(builder.build())
    }

    fn map_roles_yaml_string(&self) -> Result<String, KubernetesError> {
        let map_roles: Vec<MapRoleConfig> = self
            .roles
            .iter()
            .map(|r| MapRoleConfig {
                groups: r.groups.iter().map(|g| g.to_string()).collect(),
                rolearn: r.iam_role_arn.to_string(),
                username: r.user_name.to_string(),
            })
            .collect();

        serde_yaml::to_string(&map_roles).map_err(|e| KubernetesError::CannotSerialize {
            what: Arc::from(MAP_ROLES_KEY),
            raw_message: Arc::from(e.to_string()),
        })
    }

    fn map_users_yaml_string(&self) -> Result<String, KubernetesError> {
        let map_users: Vec<MapUserConfig> = self
            .users
            .iter()
            .map(|u| MapUserConfig {
                groups: u.groups.iter().map(|g| g.to_string()).collect(),
                userarn: u.iam_user_arn.to_string(),
                username: u.user_name.to_string(),
            })
            .collect();

        serde_yaml::to_string(&map_users).map_err(|e| KubernetesError::CannotSerialize {
            what: Arc::from(MAP_USERS_KEY),
            raw_message: Arc::from(e.to_string()),
        })
    }

    pub fn to_config_map(&self) -> Result<ConfigMap, KubernetesError> {
        let mut data = BTreeMap::from_iter(vec![(
            MAP_ROLES_KEY.to_string(),
            self.map_roles_yaml_string()?,
        )]);
        // an empty mapUsers entry makes the import of an existing config map fail
        if !self.users.is_empty() {
            data.insert(MAP_USERS_KEY.to_string(), self.map_users_yaml_string()?);
        }

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(AWS_AUTH_CONFIG_MAP_NAME.to_string()),
                namespace: Some(AWS_AUTH_CONFIG_MAP_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn to_manifest(&self) -> Result<String, KubernetesError> {
        serde_yaml::to_string(&self.to_config_map()?).map_err(|e| {
            KubernetesError::CannotSerialize {
                what: Arc::from(AWS_AUTH_CONFIG_MAP_NAME),
                raw_message: Arc::from(e.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{AuthConfigMapInput, IamIdentityInput, SsoRolePermissionSetInput};
    use crate::identity::{IdentityError, IdentityResolver, MockIdentityLookup};
    use crate::kubernetes::aws_auth::{
        AwsAuth, AwsAuthBuilder, KubernetesRole, KubernetesUser, MapRoleConfig, MapUserConfig,
        MAP_ROLES_KEY, MAP_USERS_KEY,
    };
    use crate::kubernetes::{IamArn, KubernetesGroupName, KubernetesUserName};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::Arc;

    const NODE_ROLE: &str = "arn:aws:iam::123:role/eks-nodes";

    fn iam_identity(arn: &str, username: Option<&str>, groups: &[&str]) -> IamIdentityInput {
        IamIdentityInput {
            arn: arn.to_string(),
            permission_groups: groups.iter().map(|g| g.to_string()).collect(),
            username: username.map(|u| u.to_string()),
        }
    }

    fn full_input(initial_import: bool) -> AuthConfigMapInput {
        AuthConfigMapInput {
            initial_import,
            node_group_iam_role: Some(NODE_ROLE.to_string()),
            sso_roles: vec![SsoRolePermissionSetInput {
                name: "AdministratorAccess".to_string(),
                permission_groups: vec!["system:masters".to_string()],
                username: None,
            }],
            iam_roles: vec![
                iam_identity("arn:aws:iam::123:role/ci/deployer", None, &["deployers"]),
                iam_identity("arn:aws:iam::123:role/auditor", Some("audit"), &["viewers"]),
            ],
            iam_users: vec![iam_identity(
                "arn:aws:iam::123:user/team/alice",
                None,
                &["viewers", "editors"],
            )],
            ..Default::default()
        }
    }

    fn sso_lookup() -> MockIdentityLookup {
        let mut lookup = MockIdentityLookup::new();
        lookup.expect_role_arns().returning(|_, _| {
            Ok(vec![IamArn::new(
                "arn:aws:iam::123:role/aws-reserved/sso.amazonaws.com/us-east-2/AWSReservedSSO_AdministratorAccess_53b8",
            )])
        });
        lookup
    }

    fn config_map_data(aws_auth: &AwsAuth) -> std::collections::BTreeMap<String, String> {
        aws_auth
            .to_config_map()
            .ok()
            .and_then(|c| c.data)
            .unwrap_or_default()
    }

    #[test]
    fn aws_auth_build_node_role_always_first_test() {
        // setup:
        let mut builder = AwsAuthBuilder::new(IamArn::new(NODE_ROLE), false);
        builder
            .iam_role(KubernetesRole::from_iam(&iam_identity(
                "arn:aws:iam::123:role/admin",
                None,
                &["system:masters"],
            )))
            .sso_role(KubernetesRole {
                iam_role_arn: IamArn::new("arn:aws:iam::123:role/AWSReservedSSO_Dev_1"),
                user_name: KubernetesUserName::new("Dev"),
                groups: vec![KubernetesGroupName::new("developers")],
            });

        // execute:
        let result = builder.build();

        // verify:
        assert_eq!(3, result.roles.len());
        assert_eq!(KubernetesRole::node(IamArn::new(NODE_ROLE)), result.roles[0]);
        assert_eq!(
            vec![
                KubernetesGroupName::new("system:bootstrappers"),
                KubernetesGroupName::new("system:nodes"),
            ],
            result.roles[0].groups
        );
        // sso roles come before explicit roles, whatever the call order
        assert_eq!(KubernetesUserName::new("Dev"), result.roles[1].user_name);
        assert_eq!(KubernetesUserName::new("admin"), result.roles[2].user_name);
        assert!(result.users.is_empty());
    }

    #[test]
    fn aws_auth_build_initial_import_test() {
        // setup:
        let mut builder = AwsAuthBuilder::new(IamArn::new(NODE_ROLE), true);
        builder
            .iam_role(KubernetesRole::from_iam(&iam_identity(
                "arn:aws:iam::123:role/admin",
                None,
                &["system:masters"],
            )))
            .iam_user(KubernetesUser::from_iam(&iam_identity(
                "arn:aws:iam::123:user/alice",
                None,
                &["viewers"],
            )));

        // execute:
        let result = builder.build();

        // verify:
        assert_eq!(vec![KubernetesRole::node(IamArn::new(NODE_ROLE))], result.roles);
        assert!(result.users.is_empty());
        assert!(!config_map_data(&result).contains_key(MAP_USERS_KEY));
    }

    #[test]
    fn identity_defaults_test() {
        // setup:
        struct TestCase<'a> {
            input: IamIdentityInput,
            expected_arn: &'a str,
            expected_username: &'a str,
            _description: &'a str,
        }

        let test_cases = vec![
            TestCase {
                input: iam_identity("arn:aws:iam::123:role/some/path/MyRole", None, &["g"]),
                expected_arn: "arn:aws:iam::123:role/MyRole",
                expected_username: "MyRole",
                _description: "case 1 - username defaults to the ARN trailing segment",
            },
            TestCase {
                input: iam_identity("arn:aws:iam::123:role/MyRole", Some(""), &["g"]),
                expected_arn: "arn:aws:iam::123:role/MyRole",
                expected_username: "MyRole",
                _description: "case 2 - empty username override is ignored",
            },
            TestCase {
                input: iam_identity("arn:aws:iam::123:role/some/path/MyRole", Some("me"), &["g"]),
                expected_arn: "arn:aws:iam::123:role/MyRole",
                expected_username: "me",
                _description: "case 3 - username override",
            },
        ];

        for tc in test_cases {
            // execute:
            let role = KubernetesRole::from_iam(&tc.input);
            let user = KubernetesUser::from_iam(&tc.input);

            // verify:
            assert_eq!(IamArn::new(tc.expected_arn), role.iam_role_arn);
            assert_eq!(KubernetesUserName::new(tc.expected_username), role.user_name);
            assert_eq!(IamArn::new(tc.expected_arn), user.iam_user_arn);
            assert_eq!(KubernetesUserName::new(tc.expected_username), user.user_name);
        }
    }

    #[tokio::test]
    async fn aws_auth_resolve_full_test() {
        // setup:
        let resolver = IdentityResolver::new(Arc::new(sso_lookup()));

        // execute:
        let result = AwsAuth::resolve(&full_input(false), &resolver).await;

        // verify:
        assert!(result.is_ok());
        let aws_auth = result.unwrap_or_else(|_| AwsAuth {
            roles: vec![],
            users: vec![],
        });
        let role_names: Vec<&str> = aws_auth.roles.iter().map(|r| r.user_name.as_str()).collect();
        assert_eq!(
            vec![
                "system:node:{{EC2PrivateDNSName}}",
                "AdministratorAccess",
                "deployer",
                "audit"
            ],
            role_names
        );
        assert_eq!(
            IamArn::new("arn:aws:iam::123:role/AWSReservedSSO_AdministratorAccess_53b8"),
            aws_auth.roles[1].iam_role_arn
        );
        assert_eq!(1, aws_auth.users.len());
        assert_eq!(
            IamArn::new("arn:aws:iam::123:user/alice"),
            aws_auth.users[0].iam_user_arn
        );
        assert_eq!(KubernetesUserName::new("alice"), aws_auth.users[0].user_name);
    }

    #[tokio::test]
    async fn aws_auth_resolve_initial_import_skips_lookups_test() {
        // setup:
        let mut lookup = MockIdentityLookup::new();
        lookup.expect_role_arns().times(0);
        let resolver = IdentityResolver::new(Arc::new(lookup));

        // execute:
        let result = AwsAuth::resolve(&full_input(true), &resolver).await;

        // verify:
        assert_eq!(
            Ok(AwsAuth {
                roles: vec![KubernetesRole::node(IamArn::new(NODE_ROLE))],
                users: vec![],
            }),
            result
        );
    }

    #[tokio::test]
    async fn aws_auth_resolve_sso_ambiguity_aborts_test() {
        // setup:
        let mut lookup = MockIdentityLookup::new();
        lookup.expect_role_arns().returning(|_, _| {
            Ok(vec![
                IamArn::new("arn:aws:iam::123:role/AWSReservedSSO_AdministratorAccess_1"),
                IamArn::new("arn:aws:iam::123:role/AWSReservedSSO_AdministratorAccess_2"),
            ])
        });
        let resolver = IdentityResolver::new(Arc::new(lookup));

        // execute:
        let result = AwsAuth::resolve(&full_input(false), &resolver).await;

        // verify:
        assert_eq!(
            Err(IdentityError::SsoRoleDiscovery {
                permission_set_name: Arc::from("AdministratorAccess"),
                discovered: 2,
            }),
            result
        );
    }

    #[tokio::test]
    async fn aws_auth_resolve_without_node_role_test() {
        // setup:
        let resolver = IdentityResolver::new(Arc::new(MockIdentityLookup::new()));
        let input = AuthConfigMapInput::default();

        // execute:
        let result = AwsAuth::resolve(&input, &resolver).await;

        // verify:
        assert!(matches!(result, Err(IdentityError::Configuration { .. })));
    }

    #[test]
    fn to_config_map_without_users_test() {
        // setup:
        let aws_auth = AwsAuthBuilder::new(IamArn::new(NODE_ROLE), false).build();

        // execute:
        let data = config_map_data(&aws_auth);

        // verify:
        assert_eq!(1, data.len());
        let map_roles: Vec<MapRoleConfig> =
            serde_yaml::from_str(data.get(MAP_ROLES_KEY).map(|s| s.as_str()).unwrap_or_default())
                .unwrap_or_default();
        assert_eq!(
            vec![MapRoleConfig {
                groups: vec![
                    "system:bootstrappers".to_string(),
                    "system:nodes".to_string()
                ],
                rolearn: NODE_ROLE.to_string(),
                username: "system:node:{{EC2PrivateDNSName}}".to_string(),
            }],
            map_roles
        );
    }

    #[test]
    fn to_config_map_with_users_test() {
        // setup:
        let mut builder = AwsAuthBuilder::new(IamArn::new(NODE_ROLE), false);
        builder.iam_user(KubernetesUser::from_iam(&iam_identity(
            "arn:aws:iam::123:user/alice",
            None,
            &["viewers"],
        )));
        let aws_auth = builder.build();

        // execute:
        let data = config_map_data(&aws_auth);

        // verify:
        let map_users: Vec<MapUserConfig> =
            serde_yaml::from_str(data.get(MAP_USERS_KEY).map(|s| s.as_str()).unwrap_or_default())
                .unwrap_or_default();
        assert_eq!(
            vec![MapUserConfig {
                groups: vec!["viewers".to_string()],
                userarn: "arn:aws:iam::123:user/alice".to_string(),
                username: "alice".to_string(),
            }],
            map_users
        );
        assert!(data
            .get(MAP_ROLES_KEY)
            .map(|s| s.starts_with("- groups:"))
            .unwrap_or(false));
    }

    #[test]
    fn to_manifest_test() {
        // setup:
        let aws_auth = AwsAuthBuilder::new(IamArn::new(NODE_ROLE), false).build();

        // execute:
        let manifest = aws_auth.to_manifest().unwrap_or_default();

        // verify:
        let config_map: ConfigMap = serde_yaml::from_str(&manifest).unwrap_or_default();
        assert!(manifest.contains("apiVersion: v1"));
        assert!(manifest.contains("kind: ConfigMap"));
        assert_eq!(Some("aws-auth".to_string()), config_map.metadata.name);
        assert_eq!(Some("kube-system".to_string()), config_map.metadata.namespace);
        assert!(!manifest.contains(MAP_USERS_KEY));
    }
}
