use log::warn;
use serde::Deserialize;

use crate::data::osm::Element;
use crate::data::tags::TagStore;
use crate::render::Color;

use super::parser::Rule;
use super::{Fingerprint, TriState};

/// How a feature is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Appearance {
    pub line_color: Color,
    pub fill_color: Color,
    pub polygon: bool,
    pub layer: usize,
    pub line_width: f64,
}

impl Default for Appearance {
    fn default() -> Self {
        Appearance {
            line_color: Color::gray(150),
            fill_color: Color::gray(150),
            polygon: false,
            layer: 1,
            line_width: 1.0,
        }
    }
}

impl Appearance {
    fn fingerprint(&self) -> Fingerprint {
        let colors = [self.line_color, self.fill_color];
        colors.iter()
            .fold(Fingerprint::builder(), |b, c| b.bytes(&[c.r, c.g, c.b, c.a]))
            .byte(self.polygon as u8)
            .bytes(&(self.layer as u64).to_le_bytes())
            .f64(self.line_width)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColorRuleConfig {
    pub rule: String,
    #[serde(flatten)]
    pub appearance: Appearance,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StyleConfig {
    #[serde(default)]
    pub draw_rule: Option<String>,
    #[serde(default)]
    pub default: Appearance,
    #[serde(default)]
    pub color_rules: Vec<ColorRuleConfig>,
}

#[derive(Debug, Clone)]
pub struct ColorRule {
    pub rule: Rule,
    pub appearance: Appearance,
}

/// A draw rule deciding what is shown at all and an ordered list of colour
/// rules of which the first matching one decides the appearance.
#[derive(Debug, Clone)]
pub struct Style {
    draw_rule: Option<Rule>,
    default: Appearance,
    color_rules: Vec<ColorRule>,
    fingerprint: Fingerprint,
}

impl Default for Style {
    fn default() -> Self {
        Style::new(None, Appearance::default(), Vec::new())
    }
}

fn report_invalid(which: &str, rule: &Rule) {
    if let Some(err) = rule.error() {
        warn!(
            rule = which,
            text = rule.text(),
            offset = err.offset,
            err = err.message.as_str();
            "Rule does not parse and is ignored"
        );
    }
}

impl Style {
    pub fn new(draw_rule: Option<Rule>, default: Appearance, color_rules: Vec<ColorRule>) -> Style {
        if let Some(rule) = &draw_rule {
            report_invalid("draw", rule);
        }
        for color_rule in &color_rules {
            report_invalid("color", &color_rule.rule);
        }
        let mut style = Style { draw_rule, default, color_rules, fingerprint: Fingerprint::default() };
        style.fingerprint = style.compute_fingerprint();
        style
    }

    pub fn from_config(config: &StyleConfig, tags: &TagStore) -> Style {
        Style::new(
            config.draw_rule.as_deref().map(|text| Rule::new(text, tags)),
            config.default,
            config.color_rules.iter()
                .map(|c| ColorRule { rule: Rule::new(&c.rule, tags), appearance: c.appearance })
                .collect(),
        )
    }

    fn compute_fingerprint(&self) -> Fingerprint {
        let b = match &self.draw_rule {
            Some(rule) if rule.is_valid() => Fingerprint::builder().byte(1).fingerprint(&rule.fingerprint()),
            _ => Fingerprint::builder().byte(0),
        };
        self.color_rules.iter()
            .fold(b.fingerprint(&self.default.fingerprint()), |b, c| {
                b.fingerprint(&c.rule.fingerprint()).fingerprint(&c.appearance.fingerprint())
            })
            .finish()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn bind(&mut self, tags: &TagStore) {
        if let Some(rule) = &mut self.draw_rule {
            rule.bind(tags);
        }
        for color_rule in &mut self.color_rules {
            color_rule.rule.bind(tags);
        }
    }

    /// Whether the draw rule lets the feature through. Only an explicit
    /// `False` hides it.
    pub fn is_drawn(&self, element: &Element) -> bool {
        self.draw_rule.as_ref()
            .map_or(true, |rule| rule.evaluate(element) != TriState::False)
    }

    /// Appearance of a drawn feature, `None` when the draw rule hides it.
    pub fn appearance(&self, element: &Element) -> Option<Appearance> {
        if !self.is_drawn(element) {
            return None;
        }
        let picked = self.color_rules.iter()
            .find(|c| c.rule.evaluate(element) == TriState::True)
            .map_or(self.default, |c| c.appearance);
        Some(picked)
    }
}
