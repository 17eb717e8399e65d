//! Stack template rendering and introspection
//!
//! The rendered document is a pure function of its inputs. Maps are ordered,
//! so the same logical input always yields the same bytes, and the routes
//! embedded in a live template can be read back for drift comparison.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use serde::Serialize;
use serde_json::{json, Value};
use static_egress_common::parse_destination;
use thiserror::Error;
use tracing::warn;

const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";
const TEMPLATE_DESCRIPTION: &str = "Static Egress Stack";

pub const INTERNET_GATEWAY_PARAMETER: &str = "InternetGatewayIDParameter";
pub const VPC_PARAMETER: &str = "VPCIDParameter";

/// Resources whose name starts with this prefix carry an egress route.
pub const ROUTE_RESOURCE_PREFIX: &str = "RouteToNAT";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{zones} availability zones configured but {blocks} NAT CIDR blocks")]
    ZoneCountMismatch { zones: usize, blocks: usize },

    #[error("Route table parameter {0} has no availability zone assigned")]
    MissingZone(String),

    #[error("Route table parameter {parameter} points at zone index {index}, only {zones} zones configured")]
    ZoneOutOfRange {
        parameter: String,
        index: usize,
        zones: usize,
    },

    #[error("Failed to serialize template: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse template body: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,
    description: &'static str,
    parameters: BTreeMap<String, TemplateParameter>,
    resources: BTreeMap<String, TemplateResource>,
    outputs: BTreeMap<String, TemplateOutput>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateParameter {
    #[serde(rename = "Type")]
    kind: &'static str,
    description: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateResource {
    #[serde(rename = "Type")]
    kind: &'static str,
    properties: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateOutput {
    description: String,
    value: Value,
}

/// Name of the stack parameter holding the id of the `ordinal`-th route table.
pub fn route_table_parameter(ordinal: usize) -> String {
    format!("AZ{ordinal}RouteTableIDParameter")
}

/// Identifier-safe form of a CIDR (`10.0.0.0/8` becomes `10x0x0x0y8`).
pub fn encode_cidr(net: &IpNet) -> String {
    net.to_string()
        .chars()
        .map(|c| match c {
            '.' => 'x',
            '/' => 'y',
            ':' => 'w',
            other => other,
        })
        .collect()
}

fn reference(name: &str) -> Value {
    json!({ "Ref": name })
}

fn name_tags(zone: &str) -> Value {
    json!([{ "Key": "Name", "Value": format!("nat-{zone}") }])
}

/// Renders the egress stack template.
///
/// `route_table_params` lists the route table parameters in ordinal order;
/// `route_table_zone_index` maps each of them to the index of the zone whose
/// NAT gateway its routes should use. One route resource is emitted per
/// route and route table parameter.
pub fn build_template(
    availability_zones: &[String],
    nat_cidr_blocks: &[String],
    route_table_params: &[String],
    route_table_zone_index: &BTreeMap<String, usize>,
    routes: &BTreeSet<IpNet>,
) -> Result<String, TemplateError> {
    if availability_zones.len() != nat_cidr_blocks.len() {
        return Err(TemplateError::ZoneCountMismatch {
            zones: availability_zones.len(),
            blocks: nat_cidr_blocks.len(),
        });
    }

    let mut parameters = BTreeMap::new();
    let mut resources = BTreeMap::new();
    let mut outputs = BTreeMap::new();

    parameters.insert(
        INTERNET_GATEWAY_PARAMETER.to_string(),
        TemplateParameter {
            kind: "String",
            description: "Internet Gateway ID".to_string(),
        },
    );
    parameters.insert(
        VPC_PARAMETER.to_string(),
        TemplateParameter {
            kind: "AWS::EC2::VPC::Id",
            description: "VPC ID".to_string(),
        },
    );

    for (i, (zone, cidr_block)) in availability_zones.iter().zip(nat_cidr_blocks).enumerate() {
        let n = i + 1;
        let eip = format!("EIP{n}");
        let gateway = format!("NATGateway{n}");
        let subnet = format!("NATSubnet{n}");
        let route_table = format!("NATSubnetRouteTable{n}");

        resources.insert(
            eip.clone(),
            TemplateResource {
                kind: "AWS::EC2::EIP",
                properties: json!({ "Domain": "vpc" }),
            },
        );
        resources.insert(
            gateway.clone(),
            TemplateResource {
                kind: "AWS::EC2::NatGateway",
                properties: json!({
                    "AllocationId": { "Fn::GetAtt": [eip, "AllocationId"] },
                    "SubnetId": reference(&subnet),
                }),
            },
        );
        resources.insert(
            subnet.clone(),
            TemplateResource {
                kind: "AWS::EC2::Subnet",
                properties: json!({
                    "AvailabilityZone": zone,
                    "CidrBlock": cidr_block,
                    "Tags": name_tags(zone),
                    "VpcId": reference(VPC_PARAMETER),
                }),
            },
        );
        resources.insert(
            format!("NATSubnetRoute{n}"),
            TemplateResource {
                kind: "AWS::EC2::Route",
                properties: json!({
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": reference(INTERNET_GATEWAY_PARAMETER),
                    "RouteTableId": reference(&route_table),
                }),
            },
        );
        resources.insert(
            route_table.clone(),
            TemplateResource {
                kind: "AWS::EC2::RouteTable",
                properties: json!({
                    "Tags": name_tags(zone),
                    "VpcId": reference(VPC_PARAMETER),
                }),
            },
        );
        resources.insert(
            format!("NATSubnetRouteTableAssociation{n}"),
            TemplateResource {
                kind: "AWS::EC2::SubnetRouteTableAssociation",
                properties: json!({
                    "RouteTableId": reference(&route_table),
                    "SubnetId": reference(&subnet),
                }),
            },
        );
        outputs.insert(
            eip.clone(),
            TemplateOutput {
                description: format!("external IP of the {gateway}"),
                value: reference(&eip),
            },
        );
    }

    for (i, parameter) in route_table_params.iter().enumerate() {
        let ordinal = i + 1;
        let zone_index = *route_table_zone_index
            .get(parameter)
            .ok_or_else(|| TemplateError::MissingZone(parameter.clone()))?;
        if zone_index >= availability_zones.len() {
            return Err(TemplateError::ZoneOutOfRange {
                parameter: parameter.clone(),
                index: zone_index,
                zones: availability_zones.len(),
            });
        }

        parameters.insert(
            parameter.clone(),
            TemplateParameter {
                kind: "String",
                description: format!("Route Table ID No {ordinal}"),
            },
        );

        let gateway = format!("NATGateway{}", zone_index + 1);
        for route in routes {
            resources.insert(
                format!("{ROUTE_RESOURCE_PREFIX}{ordinal}z{}", encode_cidr(route)),
                TemplateResource {
                    kind: "AWS::EC2::Route",
                    properties: json!({
                        "DestinationCidrBlock": route.to_string(),
                        "NatGatewayId": reference(&gateway),
                        "RouteTableId": reference(parameter),
                    }),
                },
            );
        }
    }

    let template = Template {
        format_version: TEMPLATE_FORMAT_VERSION,
        description: TEMPLATE_DESCRIPTION,
        parameters,
        resources,
        outputs,
    };

    serde_json::to_string(&template).map_err(TemplateError::Serialize)
}

/// Reads the egress route destinations out of a live template body.
///
/// Both the literal `DestinationCidrBlock` layout and the older layout that
/// references a parameter default are understood. Entries that cannot be
/// resolved are skipped, which makes the next comparison report a difference
/// and rewrites the template.
pub fn cidrs_from_template(body: &str) -> Result<BTreeSet<IpNet>, TemplateError> {
    let document: Value = serde_json::from_str(body).map_err(TemplateError::Parse)?;

    let mut cidrs = BTreeSet::new();
    let Some(resources) = document.get("Resources").and_then(Value::as_object) else {
        return Ok(cidrs);
    };

    for (name, resource) in resources {
        if !name.starts_with(ROUTE_RESOURCE_PREFIX) {
            continue;
        }

        let destination = resource
            .pointer("/Properties/DestinationCidrBlock")
            .and_then(|value| resolve_destination(&document, value));

        match destination.map(parse_destination) {
            Some(Ok(net)) => {
                cidrs.insert(net);
            }
            Some(Err(e)) => {
                warn!(resource = %name, error = %e, "Ignoring route with invalid destination");
            }
            None => {
                warn!(resource = %name, "Ignoring route without resolvable destination");
            }
        }
    }

    Ok(cidrs)
}

fn resolve_destination<'a>(document: &'a Value, value: &'a Value) -> Option<&'a str> {
    match value {
        Value::String(cidr) => Some(cidr.as_str()),
        Value::Object(object) => {
            let parameter = object.get("Ref")?.as_str()?;
            document
                .get("Parameters")?
                .get(parameter)?
                .get("Default")?
                .as_str()
        }
        _ => None,
    }
}
