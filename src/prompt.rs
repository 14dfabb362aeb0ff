//! Instruction text for the image-edit capability.
//!
//! Branching is done on [`CompositionMode`], resolved once from the product and the
//! request, so every mode has exactly one base clause. Modifiers (background, colour,
//! logo) append clauses after it.

use crate::catalog::{Category, CompositionTarget, DriverPart, HatType, ProductRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionMode {
    /// Hat onto the person's head.
    Head {
        hat: Option<HatType>,
        match_reference_angles: bool,
    },
    /// Golf driver head held in the person's hands; exactly one part is replaced.
    DriverHead { part: DriverPart },
    /// Any other product placed on the person.
    Generic,
    /// No person; a product shot built from catalog imagery only.
    ProductOnly,
}

impl CompositionMode {
    /// `target` is the caller's override and wins over the product's own target.
    pub fn resolve(
        product: &ProductRecord,
        target: Option<CompositionTarget>,
        driver_part: DriverPart,
        product_only: bool,
        use_reference_images: bool,
    ) -> Self {
        if product_only {
            return CompositionMode::ProductOnly;
        }
        match target.unwrap_or(product.composition_target) {
            CompositionTarget::Head => CompositionMode::Head {
                hat: product.hat_type,
                match_reference_angles: use_reference_images
                    && !product.reference_images.is_empty(),
            },
            CompositionTarget::Hands if product.category == Category::Driver => {
                CompositionMode::DriverHead { part: driver_part }
            }
            CompositionTarget::Hands
            | CompositionTarget::Body
            | CompositionTarget::Accessory
            | CompositionTarget::Other => CompositionMode::Generic,
        }
    }

    pub fn driver_part(&self) -> Option<DriverPart> {
        match self {
            CompositionMode::DriverHead { part } => Some(*part),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Background {
    #[default]
    Natural,
    Studio,
    ProductPage,
}

#[derive(Debug, Clone, Default)]
pub struct PromptModifiers {
    pub background: Background,
    pub replace_logo: bool,
    pub color: Option<String>,
}

pub fn build_prompt(
    product: &ProductRecord,
    mode: &CompositionMode,
    modifiers: &PromptModifiers,
) -> String {
    let mut clauses = vec![base_clause(product, mode, modifiers.background)];
    if !matches!(mode, CompositionMode::ProductOnly) {
        clauses.push(background_clause(modifiers.background).to_string());
    }
    apply_modifiers(clauses, product, mode, modifiers)
}

/// Caller-supplied base instruction; colour and logo modifiers still apply.
pub fn with_override(
    custom: &str,
    product: &ProductRecord,
    mode: &CompositionMode,
    modifiers: &PromptModifiers,
) -> String {
    apply_modifiers(vec![custom.trim().to_string()], product, mode, modifiers)
}

fn apply_modifiers(
    mut clauses: Vec<String>,
    product: &ProductRecord,
    mode: &CompositionMode,
    modifiers: &PromptModifiers,
) -> String {
    if let Some(color) = modifiers
        .color
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        clauses.push(color_clause(product, mode, color));
    }
    if modifiers.replace_logo {
        clauses.push(LOGO_CLAUSE.to_string());
    }
    clauses.join(" ")
}

fn product_label(product: &ProductRecord) -> String {
    let display = product.display_name();
    if display == product.name {
        product.name.clone()
    } else {
        format!("{} ({display})", product.name)
    }
}

fn base_clause(product: &ProductRecord, mode: &CompositionMode, background: Background) -> String {
    let label = product_label(product);
    match mode {
        CompositionMode::Head {
            hat,
            match_reference_angles,
        } => {
            let hat_text = hat.unwrap_or(HatType::Other).catalog_label();
            let mut clause = format!(
                "Place the {label} {hat_text} on the person's head. The hat should fit naturally on the head, \
                 keeping the person's facial features, hair, and all other elements exactly the same. \
                 The hat should match the person's head size, angle, lighting, and shadows."
            );
            if *match_reference_angles {
                clause.push(' ');
                clause.push_str(ANGLE_CLAUSE);
            }
            clause
        }
        CompositionMode::DriverHead { part } => driver_clause(&label, *part),
        CompositionMode::Generic => format!(
            "Place the {label} on the person naturally, as if it was part of the original photo. \
             Keep the person, pose, clothing, and everything else exactly the same."
        ),
        CompositionMode::ProductOnly => format!(
            "Product-only shot of the {label}, no people. {}. High detail, sharp focus, 4k.",
            product_only_backdrop(background)
        ),
    }
}

pub(crate) const ANGLE_CLAUSE: &str = "Use the additional reference images of the product to match its angle, \
     shape, and details to the person's head orientation.";

pub(crate) const CROWN_MARKER: &str = "ONLY the crown";
pub(crate) const SOLE_MARKER: &str = "ONLY the sole";
pub(crate) const FACE_MARKER: &str = "ONLY the face";
pub(crate) const FULL_MARKER: &str = "ONLY the driver head";

fn driver_clause(label: &str, part: DriverPart) -> String {
    match part {
        DriverPart::Crown => format!(
            "Replace {CROWN_MARKER} (the top surface of the driver head) with the crown of the {label}. \
             Keep the sole, the face, the shaft, the hands, the grip, and the posture exactly unchanged."
        ),
        DriverPart::Sole => format!(
            "Replace {SOLE_MARKER} (the bottom plate of the driver head) with the sole of the {label}. \
             Keep the crown, the face, the shaft, the hands, the grip, and the posture exactly unchanged."
        ),
        DriverPart::Face => format!(
            "Replace {FACE_MARKER} (the striking surface of the driver head) with the face of the {label}. \
             Keep the crown, the sole, the shaft, the hands, the grip, and the posture exactly unchanged."
        ),
        DriverPart::Full => format!(
            "Replace {FULL_MARKER} held by the person with the full head of the {label}. \
             Keep the shaft, the hands, the grip, and the posture exactly unchanged."
        ),
    }
}

fn background_clause(background: Background) -> &'static str {
    match background {
        Background::Natural => "Keep the original background exactly as it is.",
        Background::Studio => {
            "Replace the background with a premium golf shop display with well-lit shelves and an upscale retail look."
        }
        Background::ProductPage => {
            "Replace the background with a clean white or light-gray studio backdrop in e-commerce product page style with soft shadows."
        }
    }
}

fn product_only_backdrop(background: Background) -> &'static str {
    match background {
        Background::Natural => "Outdoor golf course vibe, natural light",
        Background::Studio => "Premium golf shop display, well-lit shelves, upscale retail",
        Background::ProductPage => {
            "Clean white or light-gray studio background, e-commerce product page style, soft shadows, no distractions"
        }
    }
}

fn color_clause(product: &ProductRecord, mode: &CompositionMode, color: &str) -> String {
    let subject = match mode {
        CompositionMode::Head { .. } => "hat",
        CompositionMode::DriverHead { .. } => "driver head",
        CompositionMode::Generic | CompositionMode::ProductOnly => "product",
    };
    format!(
        "Change the color of the {subject} ({}) to {color}, keeping its shape, logo, texture, and material exactly the same. \
         Do not change the color of anything else.",
        product.name
    )
}

const LOGO_CLAUSE: &str = "Replace any visible logo on the product with the MASSGOO logo, matching the original logo's \
     size, position, perspective, and lighting.";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn driver() -> ProductRecord {
        ProductRecord {
            id: "d-1".into(),
            slug: "secret-weapon-black".into(),
            name: "Secret Weapon Black".into(),
            display_name: Some("시크리트웨폰 블랙".into()),
            category: Category::Driver,
            composition_target: CompositionTarget::Hands,
            image_url: Some("originals/products/secret-weapon-black/main.webp".into()),
            reference_images: vec![],
            driver_parts: BTreeMap::new(),
            hat_type: None,
        }
    }

    fn bucket_hat(reference_images: Vec<String>) -> ProductRecord {
        ProductRecord {
            id: "h-1".into(),
            slug: "massgoo-bucket".into(),
            name: "MASSGOO Bucket".into(),
            display_name: None,
            category: Category::Hat,
            composition_target: CompositionTarget::Head,
            image_url: Some("originals/goods/massgoo-bucket/main.webp".into()),
            reference_images,
            driver_parts: BTreeMap::new(),
            hat_type: Some(HatType::Bucket),
        }
    }

    const MARKERS: [&str; 4] = [CROWN_MARKER, SOLE_MARKER, FACE_MARKER, FULL_MARKER];

    #[test]
    fn head_bucket_without_references_omits_angle_clause() {
        let product = bucket_hat(vec![]);
        let mode = CompositionMode::resolve(&product, None, DriverPart::Full, false, true);
        let prompt = build_prompt(&product, &mode, &PromptModifiers::default());
        assert!(prompt.contains("버킷햇"));
        assert!(prompt.contains(&product.name));
        assert!(prompt.contains("facial features, hair"));
        assert!(!prompt.contains(ANGLE_CLAUSE));
    }

    #[test]
    fn head_angle_clause_requires_references_and_request() {
        let product = bucket_hat(vec!["originals/goods/massgoo-bucket/side.webp".into()]);
        let requested = CompositionMode::resolve(&product, None, DriverPart::Full, false, true);
        let declined = CompositionMode::resolve(&product, None, DriverPart::Full, false, false);
        let modifiers = PromptModifiers::default();
        assert!(build_prompt(&product, &requested, &modifiers).contains(ANGLE_CLAUSE));
        assert!(!build_prompt(&product, &declined, &modifiers).contains(ANGLE_CLAUSE));
    }

    #[test]
    fn driver_crown_replaces_only_the_crown() {
        let product = driver();
        let mode = CompositionMode::resolve(&product, None, DriverPart::Crown, false, true);
        assert_eq!(mode, CompositionMode::DriverHead { part: DriverPart::Crown });
        let prompt = build_prompt(&product, &mode, &PromptModifiers::default());
        assert!(prompt.contains("ONLY the crown"));
        assert!(prompt.contains("Keep the sole, the face"));
        assert!(prompt.contains("the hands, the grip"));
    }

    #[test]
    fn every_driver_part_emits_exactly_one_part_clause() {
        let product = driver();
        for (part, marker) in [
            (DriverPart::Crown, CROWN_MARKER),
            (DriverPart::Sole, SOLE_MARKER),
            (DriverPart::Face, FACE_MARKER),
            (DriverPart::Full, FULL_MARKER),
        ] {
            let mode = CompositionMode::resolve(&product, None, part, false, true);
            let prompt = build_prompt(&product, &mode, &PromptModifiers::default());
            let present: Vec<&str> = MARKERS
                .iter()
                .copied()
                .filter(|m| prompt.contains(m))
                .collect();
            assert_eq!(present, vec![marker], "part {part:?}");
        }
    }

    #[test]
    fn non_driver_hands_and_unknown_targets_use_generic_clause() {
        let mut glove = driver();
        glove.category = Category::Apparel;
        let mode = CompositionMode::resolve(&glove, None, DriverPart::Crown, false, true);
        assert_eq!(mode, CompositionMode::Generic);

        let mut odd = driver();
        odd.composition_target = CompositionTarget::Other;
        let mode = CompositionMode::resolve(&odd, None, DriverPart::Crown, false, true);
        assert_eq!(mode, CompositionMode::Generic);
        let prompt = build_prompt(&odd, &mode, &PromptModifiers::default());
        assert!(prompt.contains("on the person naturally"));
        assert!(MARKERS.iter().all(|m| !prompt.contains(m)));
    }

    #[test]
    fn request_target_overrides_product_target() {
        let product = driver();
        let mode = CompositionMode::resolve(
            &product,
            Some(CompositionTarget::Body),
            DriverPart::Sole,
            false,
            true,
        );
        assert_eq!(mode, CompositionMode::Generic);
    }

    #[test]
    fn every_mode_and_modifier_mix_is_non_empty_and_names_the_product() {
        let products = [driver(), bucket_hat(vec!["side.webp".into()])];
        let targets = [
            None,
            Some(CompositionTarget::Hands),
            Some(CompositionTarget::Head),
            Some(CompositionTarget::Body),
            Some(CompositionTarget::Accessory),
            Some(CompositionTarget::Other),
        ];
        let parts = [
            DriverPart::Crown,
            DriverPart::Sole,
            DriverPart::Face,
            DriverPart::Full,
        ];
        let backgrounds = [Background::Natural, Background::Studio, Background::ProductPage];
        for product in &products {
            for target in targets {
                for part in parts {
                    for product_only in [false, true] {
                        for background in backgrounds {
                            let mode =
                                CompositionMode::resolve(product, target, part, product_only, true);
                            let modifiers = PromptModifiers {
                                background,
                                replace_logo: product_only,
                                color: product_only.then(|| "navy".to_string()),
                            };
                            let prompt = build_prompt(product, &mode, &modifiers);
                            assert!(!prompt.trim().is_empty());
                            assert!(prompt.contains(&product.name));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn product_only_uses_requested_backdrop() {
        let product = driver();
        let mode = CompositionMode::resolve(&product, None, DriverPart::Full, true, true);
        assert_eq!(mode, CompositionMode::ProductOnly);
        let modifiers = PromptModifiers {
            background: Background::ProductPage,
            ..Default::default()
        };
        let prompt = build_prompt(&product, &mode, &modifiers);
        assert!(prompt.starts_with("Product-only shot"));
        assert!(prompt.contains("e-commerce product page style"));
        assert!(!prompt.contains("Keep the original background"));
    }

    #[test]
    fn color_and_logo_modifiers_append_to_override() {
        let product = driver();
        let mode = CompositionMode::DriverHead {
            part: DriverPart::Full,
        };
        let modifiers = PromptModifiers {
            background: Background::Natural,
            replace_logo: true,
            color: Some("red".into()),
        };
        let prompt = with_override("Make it shine.", &product, &mode, &modifiers);
        assert!(prompt.starts_with("Make it shine."));
        assert!(prompt.contains("driver head (Secret Weapon Black) to red"));
        assert!(prompt.contains("MASSGOO logo"));
    }

    #[test]
    fn blank_color_is_ignored() {
        let product = driver();
        let mode = CompositionMode::Generic;
        let modifiers = PromptModifiers {
            color: Some("   ".into()),
            ..Default::default()
        };
        assert!(!build_prompt(&product, &mode, &modifiers).contains("Change the color"));
    }
}
