// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon wiring helpers: service construction and the NIP-89
//! handler-information advertisement.

#![deny(unsafe_code)]

use std::sync::Arc;

use nostr::{EventBuilder, Kind, Tag, TagKind};

use dvm_config::Settings;
use dvm_core::KIND_HANDLER_INFO;
use dvm_service::{
    DiscoveryService, ImageGenerationService, InferenceBackend, ServiceRegistry,
    TextGenerationService, TranslationService, UrlExtractionService,
};

/// Build the full service registry from configured prices.
pub fn build_services(settings: &Settings, backend: Arc<dyn InferenceBackend>) -> ServiceRegistry {
    let costs = &settings.costs;
    ServiceRegistry::new()
        .with(Arc::new(TranslationService::new(
            Arc::clone(&backend),
            costs.translation_msats,
        )))
        .with(Arc::new(TextGenerationService::new(
            Arc::clone(&backend),
            costs.text_generation_msats,
            costs.summarization_msats,
        )))
        .with(Arc::new(UrlExtractionService::new(
            Arc::clone(&backend),
            costs.text_extraction_msats,
        )))
        .with(Arc::new(ImageGenerationService::new(
            Arc::clone(&backend),
            costs.image_generation_msats,
        )))
        .with(Arc::new(DiscoveryService::new(backend, costs.default_msats)))
}

/// Kind-31990 handler-information event advertising the agent's services:
/// one `d` tag carrying the agent identifier, one `k` tag per supported
/// kind, and one `nip90` tag per service with `(kind, name, cost)`.
pub fn handler_info_builder(settings: &Settings, registry: &ServiceRegistry) -> EventBuilder {
    let metadata = serde_json::json!({
        "name": settings.agent_identifier,
        "display_name": settings.agent_name,
        "about": "AI services paid with Lightning sats over Nostr.",
        "picture": "",
        "lud16": settings.lightning_address,
    })
    .to_string();

    let mut tags: Vec<Tag> = vec![Tag::Identifier(settings.agent_identifier.clone())];

    for kind in registry.kinds() {
        tags.push(Tag::Generic(
            TagKind::Custom("k".to_string()),
            vec![kind.to_string()],
        ));
    }
    for (kind, service) in registry.iter() {
        tags.push(Tag::Generic(
            TagKind::Custom("nip90".to_string()),
            vec![
                kind.to_string(),
                service.name().to_string(),
                service.default_price_msats().to_string(),
            ],
        ));
    }

    EventBuilder::new(Kind::from(KIND_HANDLER_INFO as u64), metadata, tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvm_core::kind_number;
    use dvm_service::MockInference;
    use nostr::Keys;

    fn advertised() -> nostr::Event {
        let settings = Settings::default();
        let registry = build_services(&settings, Arc::new(MockInference::default()));
        handler_info_builder(&settings, &registry)
            .to_event(&Keys::generate())
            .unwrap()
    }

    #[test]
    fn registry_covers_all_five_kinds() {
        let settings = Settings::default();
        let registry = build_services(&settings, Arc::new(MockInference::default()));
        assert_eq!(registry.kinds(), vec![5000, 5001, 5002, 5100, 5300]);
    }

    #[test]
    fn advertisement_has_expected_kind_and_d_tag() {
        let event = advertised();
        assert_eq!(kind_number(event.kind), KIND_HANDLER_INFO);

        let d_tags: Vec<_> = event
            .tags
            .iter()
            .map(|t| t.as_vec())
            .filter(|v| v[0] == "d")
            .collect();
        assert_eq!(d_tags.len(), 1);
        assert_eq!(d_tags[0][1], "sats-ai-dvm");
    }

    #[test]
    fn advertisement_lists_every_kind_and_service() {
        let event = advertised();
        let tags: Vec<Vec<String>> = event.tags.iter().map(|t| t.as_vec()).collect();

        let k_values: Vec<&str> = tags
            .iter()
            .filter(|v| v[0] == "k")
            .map(|v| v[1].as_str())
            .collect();
        assert_eq!(k_values, vec!["5000", "5001", "5002", "5100", "5300"]);

        let nip90: Vec<&Vec<String>> = tags.iter().filter(|v| v[0] == "nip90").collect();
        assert_eq!(nip90.len(), 5);
        let translation = nip90.iter().find(|v| v[1] == "5000").unwrap();
        assert_eq!(translation[2], "Translation");
        assert_eq!(translation[3], "300");
    }

    #[test]
    fn advertisement_metadata_carries_lightning_address() {
        let event = advertised();
        let metadata: serde_json::Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(metadata["lud16"], "satsai@strike.me");
        assert_eq!(metadata["display_name"], "sats.ai DVM Agent");
    }
}
