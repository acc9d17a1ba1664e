use crate::config::VpcConfigInput;
use crate::infra::{InfraError, ResourceGraph, ResourceRef};
use serde_json::{json, Map, Value};
use tracing::info;

const DEFAULT_ROUTE_CIDR: &str = "0.0.0.0/0";

/// Resources later planners build on.
#[derive(Clone, Debug, PartialEq)]
pub struct VpcOutputs {
    pub vpc: ResourceRef,
    pub public_subnets: Vec<ResourceRef>,
    pub private_subnets: Vec<ResourceRef>,
    pub nat_gateway_ips: Vec<ResourceRef>,
}

impl VpcOutputs {
    pub fn private_subnet_ids(&self) -> Vec<String> {
        self.private_subnets.iter().map(|s| s.id()).collect()
    }
}

fn cluster_tag(stack_name: &str) -> String {
    format!("kubernetes.io/cluster/{stack_name}")
}

/// Plans a VPC spanning every configured availability zone. Each zone gets a public subnet routed
/// to the internet gateway and a private subnet routed to a NAT gateway living in that same zone.
pub fn plan_vpc(
    graph: &mut ResourceGraph,
    stack_name: &str,
    config: &VpcConfigInput,
) -> Result<VpcOutputs, InfraError> {
    config.validate()?;

    let vpc = graph.register(
        &format!("{stack_name}-vpc"),
        "aws:ec2/vpc:Vpc",
        json!({
            "cidrBlock": config.cidr,
            "tags": { "Name": stack_name },
        }),
        &[],
    )?;
    let internet_gateway = graph.register(
        &format!("{stack_name}-internet-gateway"),
        "aws:ec2/internetGateway:InternetGateway",
        json!({ "vpcId": vpc.id() }),
        &[],
    )?;

    let mut outputs = VpcOutputs {
        vpc: vpc.clone(),
        public_subnets: Vec::with_capacity(config.availability_zones.len()),
        private_subnets: Vec::with_capacity(config.availability_zones.len()),
        nat_gateway_ips: Vec::with_capacity(config.availability_zones.len()),
    };

    for (i, az) in config.availability_zones.iter().enumerate() {
        let mut public_tags = Map::new();
        public_tags.insert(cluster_tag(stack_name), Value::from("owned"));
        public_tags.insert("kubernetes.io/role/elb".to_string(), Value::from("1"));
        let public_subnet = graph.register(
            &format!("{stack_name}-public-subnet-{i}"),
            "aws:ec2/subnet:Subnet",
            json!({
                "vpcId": vpc.id(),
                "cidrBlock": az.public_subnet_cidr,
                "availabilityZone": az.az_name,
                "tags": public_tags,
            }),
            &[],
        )?;
        let public_route_table = graph.register(
            &format!("{stack_name}-public-route-table-{i}"),
            "aws:ec2/routeTable:RouteTable",
            json!({ "vpcId": vpc.id() }),
            &[],
        )?;
        graph.register(
            &format!("{stack_name}-public-route-{i}"),
            "aws:ec2/route:Route",
            json!({
                "routeTableId": public_route_table.id(),
                "destinationCidrBlock": DEFAULT_ROUTE_CIDR,
                "gatewayId": internet_gateway.id(),
            }),
            &[],
        )?;
        graph.register(
            &format!("{stack_name}-public-route-table-association-{i}"),
            "aws:ec2/routeTableAssociation:RouteTableAssociation",
            json!({
                "subnetId": public_subnet.id(),
                "routeTableId": public_route_table.id(),
            }),
            &[],
        )?;

        let nat_gateway_ip = graph.register(
            &format!("{stack_name}-elastic-ip-{i}"),
            "aws:ec2/eip:Eip",
            json!({ "vpc": true }),
            &[],
        )?;
        let nat_gateway = graph.register(
            &format!("{stack_name}-nat-gateway-{i}"),
            "aws:ec2/natGateway:NatGateway",
            json!({
                "allocationId": nat_gateway_ip.id(),
                "subnetId": public_subnet.id(),
            }),
            &[],
        )?;

        let mut private_tags = Map::new();
        private_tags.insert(cluster_tag(stack_name), Value::from("owned"));
        let private_subnet = graph.register(
            &format!("{stack_name}-private-subnet-{i}"),
            "aws:ec2/subnet:Subnet",
            json!({
                "vpcId": vpc.id(),
                "cidrBlock": az.private_subnet_cidr,
                "availabilityZone": az.az_name,
                "tags": private_tags,
            }),
            &[],
        )?;
        let private_route_table = graph.register(
            &format!("{stack_name}-private-route-table-{i}"),
            "aws:ec2/routeTable:RouteTable",
            json!({ "vpcId": vpc.id() }),
            &[],
        )?;
        graph.register(
            &format!("{stack_name}-private-route-{i}"),
            "aws:ec2/route:Route",
            json!({
                "routeTableId": private_route_table.id(),
                "destinationCidrBlock": DEFAULT_ROUTE_CIDR,
                "natGatewayId": nat_gateway.id(),
            }),
            &[],
        )?;
        graph.register(
            &format!("{stack_name}-private-route-table-association-{i}"),
            "aws:ec2/routeTableAssociation:RouteTableAssociation",
            json!({
                "subnetId": private_subnet.id(),
                "routeTableId": private_route_table.id(),
            }),
            &[],
        )?;

        outputs.public_subnets.push(public_subnet);
        outputs.private_subnets.push(private_subnet);
        outputs.nat_gateway_ips.push(nat_gateway_ip);
    }

    graph.export("vpcId", json!(vpc.id()));
    graph.export(
        "publicSubnetIds",
        json!(outputs.public_subnets.iter().map(|s| s.id()).collect::<Vec<_>>()),
    );
    graph.export("privateSubnetIds", json!(outputs.private_subnet_ids()));
    // elastic IP allocation ids, not the public addresses
    graph.export(
        "natGatewayIps",
        json!(outputs
            .nat_gateway_ips
            .iter()
            .map(|ip| ip.id())
            .collect::<Vec<_>>()),
    );

    info!(
        "Planned VPC `{stack_name}` across {} availability zone(s)",
        config.availability_zones.len()
    );
    Ok(outputs)
}
