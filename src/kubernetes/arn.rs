use crate::kubernetes::{IamArn, KubernetesUserName};

const PATH_DELIMITER: char = '/';

/// Removes the path segments of an IAM ARN, keeping only the part before the first `/` and the
/// resource name after the last one.
///
/// The aws-auth config map does not support ARNs with paths:
/// https://docs.aws.amazon.com/eks/latest/userguide/troubleshooting_iam.html#security-iam-troubleshoot-ConfigMap
///
/// E.g: arn:aws:iam::843237586875:role/aws-reserved/sso.amazonaws.com/us-east-2/AWSReservedSSO_AdministratorAccess_53b82e109c5e2cac
/// becomes => arn:aws:iam::843237586875:role/AWSReservedSSO_AdministratorAccess_53b82e109c5e2cac
pub fn strip_path(arn: &IamArn) -> IamArn {
    let raw = arn.as_str();
    match (raw.find(PATH_DELIMITER), raw.rfind(PATH_DELIMITER)) {
        (Some(first), Some(last)) if first != last => {
            IamArn::new(&format!("{}{}", &raw[..=first], &raw[last + 1..]))
        }
        _ => arn.clone(),
    }
}

/// Resource name of an ARN, i.e. everything after the last `/`.
pub fn derive_username(arn: &IamArn) -> KubernetesUserName {
    let raw = arn.as_str();
    match raw.rfind(PATH_DELIMITER) {
        Some(last) => KubernetesUserName::new(&raw[last + 1..]),
        None => KubernetesUserName::new(raw),
    }
}
