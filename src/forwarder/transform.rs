//! Topic Mapping and Forwarding Policy
//!
//! Decides whether a message crosses a bridge and how it looks on the other
//! side: loop prevention, exclusions, destination topic, QoS ceiling, retain
//! policy and user properties.

use std::fmt;

use bytes::Bytes;

use super::DropReason;
use crate::config::{LocalSubscription, RemoteSubscription};
use crate::message::{self, OutboundPublish, QoS, UserProperty};
use crate::topic::validation::topic_matches_filter;

/// One piece of a destination template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{#}`: the whole source topic
    FullTopic,
    /// `{N}`: the N-th source topic level (1-based)
    Level(usize),
    /// `{bridge.id}`
    BridgeId,
}

/// Error parsing a destination template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError(String);

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TemplateError {}

/// Compiled destination topic template
///
/// `edge/{bridge.id}/{#}` maps `sensors/temp` to `edge/cloud/sensors/temp`;
/// `site/{2}` maps `plant/7/temp` to `site/7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    segments: Vec<Segment>,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if template.is_empty() {
            return Err(TemplateError("template cannot be empty".to_string()));
        }

        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Self::literal(&rest[..open])?);
            }
            let Some(close) = rest[open..].find('}') else {
                return Err(TemplateError("unclosed '{' in template".to_string()));
            };
            let name = &rest[open + 1..open + close];
            segments.push(match name {
                "#" => Segment::FullTopic,
                "bridge.id" => Segment::BridgeId,
                _ => match name.parse::<usize>() {
                    Ok(level) if level >= 1 => Segment::Level(level),
                    _ => {
                        return Err(TemplateError(format!(
                            "unknown placeholder '{{{}}}'",
                            name
                        )))
                    }
                },
            });
            rest = &rest[open + close + 1..];
        }

        if !rest.is_empty() {
            segments.push(Self::literal(rest)?);
        }

        Ok(Self { segments })
    }

    fn literal(text: &str) -> Result<Segment, TemplateError> {
        if text.contains(['+', '#', '}', '\0']) {
            return Err(TemplateError(format!(
                "invalid characters in template text '{}'",
                text
            )));
        }
        Ok(Segment::Literal(text.to_string()))
    }

    /// Render the destination for a source topic
    ///
    /// Levels past the end of the source topic render as empty.
    pub fn render(&self, topic: &str, bridge_id: &str) -> String {
        let mut out = String::with_capacity(topic.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::FullTopic => out.push_str(topic),
                Segment::BridgeId => out.push_str(bridge_id),
                Segment::Level(n) => {
                    if let Some(level) = topic.split('/').nth(n - 1) {
                        out.push_str(level);
                    }
                }
            }
        }
        out
    }
}

/// Per-subscription forwarding rules
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    bridge_id: String,
    destination: Option<TopicTemplate>,
    excludes: Vec<String>,
    max_qos: QoS,
    preserve_retain: bool,
    custom_properties: Vec<(String, String)>,
    max_hops: u32,
}

impl ForwardPolicy {
    /// Policy for local messages going to the remote broker
    pub fn outbound(
        bridge_id: &str,
        subscription: &LocalSubscription,
        max_hops: u32,
    ) -> Result<Self, TemplateError> {
        Ok(Self {
            bridge_id: bridge_id.to_string(),
            destination: Self::compile(subscription.destination.as_deref())?,
            excludes: subscription.excludes.clone(),
            max_qos: subscription.max_qos(),
            preserve_retain: subscription.preserve_retain,
            custom_properties: Self::properties(&subscription.custom_user_properties),
            max_hops,
        })
    }

    /// Policy for remote messages coming into the gateway
    pub fn inbound(
        bridge_id: &str,
        subscription: &RemoteSubscription,
        max_hops: u32,
    ) -> Result<Self, TemplateError> {
        Ok(Self {
            bridge_id: bridge_id.to_string(),
            destination: Self::compile(subscription.destination.as_deref())?,
            excludes: Vec::new(),
            max_qos: subscription.max_qos(),
            preserve_retain: subscription.preserve_retain,
            custom_properties: Self::properties(&subscription.custom_user_properties),
            max_hops,
        })
    }

    fn compile(template: Option<&str>) -> Result<Option<TopicTemplate>, TemplateError> {
        template.map(TopicTemplate::parse).transpose()
    }

    fn properties(props: &[UserProperty]) -> Vec<(String, String)> {
        props
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Whether a topic hits one of the exclusion filters
    pub fn is_excluded(&self, topic: &str) -> bool {
        self.excludes
            .iter()
            .any(|filter| topic_matches_filter(topic, filter))
    }

    /// Destination topic for a source topic
    pub fn destination(&self, topic: &str) -> String {
        match self.destination {
            Some(ref template) => {
                let rendered = template.render(topic, &self.bridge_id);
                if rendered.is_empty() {
                    topic.to_string()
                } else {
                    rendered
                }
            }
            None => topic.to_string(),
        }
    }

    /// Apply the policy to a message
    ///
    /// Returns the publish to send, or why the message must not cross the bridge.
    pub fn apply(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        user_properties: &[(String, String)],
    ) -> Result<OutboundPublish, DropReason> {
        let hops = message::hop_count(user_properties);
        if hops >= self.max_hops {
            return Err(DropReason::HopLimit);
        }

        if self.is_excluded(topic) {
            return Err(DropReason::Excluded);
        }

        let mut properties = user_properties.to_vec();
        properties.extend(self.custom_properties.iter().cloned());
        message::set_hop_count(&mut properties, hops.saturating_add(1));

        Ok(OutboundPublish {
            topic: self.destination(topic),
            payload,
            qos: qos.min(self.max_qos),
            retain: retain && self.preserve_retain,
            user_properties: properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HOP_COUNT_PROPERTY;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn policy(configure: impl FnOnce(&mut LocalSubscription)) -> ForwardPolicy {
        let mut sub = LocalSubscription::new(["sensors/#"]);
        configure(&mut sub);
        ForwardPolicy::outbound("cloud", &sub, 1).unwrap()
    }

    fn apply(policy: &ForwardPolicy, topic: &str, props: &[(&str, &str)]) -> Result<OutboundPublish, DropReason> {
        let props: Vec<_> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        policy.apply(topic, Bytes::from_static(b"v"), QoS::ExactlyOnce, true, &props)
    }

    #[test_case("edge/{#}", "sensors/temp", "edge/sensors/temp" ; "full topic")]
    #[test_case("{bridge.id}/{1}/x", "sensors/temp", "cloud/sensors/x" ; "bridge id and level")]
    #[test_case("site/{2}", "plant/7/temp", "site/7" ; "second level")]
    #[test_case("a/{5}", "plant/7", "a/" ; "missing level")]
    #[test_case("fixed/topic", "anything", "fixed/topic" ; "no placeholders")]
    fn test_template_render(template: &str, topic: &str, expected: &str) {
        let template = TopicTemplate::parse(template).unwrap();
        assert_eq!(template.render(topic, "cloud"), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("a/{0}" ; "zero level")]
    #[test_case("a/{name}" ; "unknown placeholder")]
    #[test_case("a/{#" ; "unclosed")]
    #[test_case("a/+/{#}" ; "wildcard literal")]
    fn test_template_rejects(template: &str) {
        assert!(TopicTemplate::parse(template).is_err());
    }

    #[test]
    fn test_hop_limit_drops() {
        let policy = policy(|_| {});
        assert_eq!(
            apply(&policy, "sensors/a", &[(HOP_COUNT_PROPERTY, "1")]).unwrap_err(),
            DropReason::HopLimit
        );
        assert_eq!(
            apply(&policy, "sensors/a", &[(HOP_COUNT_PROPERTY, "7")]).unwrap_err(),
            DropReason::HopLimit
        );
    }

    #[test]
    fn test_hop_count_incremented() {
        let policy = policy(|_| {});
        let out = apply(&policy, "sensors/a", &[]).unwrap();
        assert_eq!(out.hop_count(), 1);

        // Unparseable counts as zero
        let out = apply(&policy, "sensors/a", &[(HOP_COUNT_PROPERTY, "junk")]).unwrap();
        assert_eq!(out.hop_count(), 1);
    }

    #[test]
    fn test_exclusion() {
        let policy = policy(|s| s.excludes.push("sensors/debug/#".to_string()));
        assert_eq!(
            apply(&policy, "sensors/debug/x", &[]).unwrap_err(),
            DropReason::Excluded
        );
        assert!(apply(&policy, "sensors/prod/x", &[]).is_ok());
    }

    #[test]
    fn test_qos_retain_and_properties() {
        let out = apply(&policy(|_| {}), "sensors/a", &[("origin", "plc")]).unwrap();
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert!(!out.retain);
        assert!(out
            .user_properties
            .contains(&("origin".to_string(), "plc".to_string())));

        let out = apply(
            &policy(|s| {
                s.preserve_retain = true;
                s.max_qos = 2;
                s.destination = Some("edge/{#}".to_string());
                s.custom_user_properties
                    .push(UserProperty::new("site", "plant-7"));
            }),
            "sensors/a",
            &[],
        )
        .unwrap();
        assert_eq!(out.topic, "edge/sensors/a");
        assert_eq!(out.qos, QoS::ExactlyOnce);
        assert!(out.retain);
        assert!(out
            .user_properties
            .contains(&("site".to_string(), "plant-7".to_string())));
    }

    #[test]
    fn test_higher_hop_limit() {
        let sub = LocalSubscription::new(["#"]);
        let policy = ForwardPolicy::outbound("b", &sub, 3).unwrap();
        let out = apply(&policy, "t", &[(HOP_COUNT_PROPERTY, "2")]).unwrap();
        assert_eq!(out.hop_count(), 3);
    }
}
