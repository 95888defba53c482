use xxhash_rust::xxh3::xxh3_64;

/// An SGR parameter sequence such as `"96"` or `"31;1"`. An empty sequence
/// renders text unchanged, which is how disabled color output is modeled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Color {
    sgr: String,
}

impl Color {
    pub fn new(sgr: impl Into<String>) -> Self {
        Self { sgr: sgr.into() }
    }

    pub fn none() -> Self {
        Self { sgr: String::new() }
    }

    pub fn as_sgr(&self) -> &str {
        &self.sgr
    }

    pub fn paint(&self, text: &str) -> String {
        paint_sgr(&self.sgr, text)
    }
}

pub fn paint_sgr(sgr: &str, text: &str) -> String {
    if sgr.is_empty() {
        text.to_string()
    } else {
        format!("\x1b[{}m{}\x1b[0m", sgr, text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ColorError {
    #[error("namespace-colors must not be empty")]
    EmptyNamespaceColors,
    #[error("namespace-colors and container-colors must have the same length")]
    LengthMismatch,
    #[error("invalid SGR sequence: {0:?}")]
    InvalidSgr(String),
}

/// Color pairs used to distinguish targets: the first member of each pair
/// styles the compose project (namespace), the second the container.
#[derive(Debug, Clone)]
pub struct Palette {
    pairs: Vec<(Color, Color)>,
    enabled: bool,
}

// Bright variant for the namespace, regular for the container.
const DEFAULT_PAIRS: [(&str, &str); 6] = [
    ("96", "36"), // cyan
    ("92", "32"), // green
    ("95", "35"), // magenta
    ("93", "33"), // yellow
    ("94", "34"), // blue
    ("91", "31"), // red
];

impl Palette {
    pub fn standard(enabled: bool) -> Self {
        let pairs = DEFAULT_PAIRS
            .iter()
            .map(|(ns, c)| (Color::new(*ns), Color::new(*c)))
            .collect();
        Self { pairs, enabled }
    }

    /// Builds a palette from user supplied SGR sequences. Container colors
    /// default to the namespace colors and must otherwise match their length.
    pub fn from_sgr_lists(
        namespace_colors: &[String],
        container_colors: &[String],
        enabled: bool,
    ) -> Result<Self, ColorError> {
        if namespace_colors.is_empty() {
            return Err(ColorError::EmptyNamespaceColors);
        }
        let container_colors = if container_colors.is_empty() {
            namespace_colors
        } else {
            if container_colors.len() != namespace_colors.len() {
                return Err(ColorError::LengthMismatch);
            }
            container_colors
        };

        let mut pairs = Vec::with_capacity(namespace_colors.len());
        for (ns, c) in namespace_colors.iter().zip(container_colors) {
            pairs.push((parse_sgr(ns)?, parse_sgr(c)?));
        }
        Ok(Self { pairs, enabled })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Picks the (namespace, container) colors for a target. The container
    /// color is hashed from the container name; the namespace color from the
    /// compose project, falling back to the first pair for plain containers.
    pub fn for_target(&self, container_name: &str, compose_project: &str) -> (Color, Color) {
        if !self.enabled {
            return (Color::none(), Color::none());
        }
        let container_color = self.pairs[self.index_of(container_name)].1.clone();
        let namespace_color = if compose_project.is_empty() {
            self.pairs[0].0.clone()
        } else {
            self.pairs[self.index_of(compose_project)].0.clone()
        };
        (namespace_color, container_color)
    }

    pub fn banner_start(&self) -> Color {
        self.fixed("92;1")
    }

    pub fn banner_stop(&self) -> Color {
        self.fixed("91;1")
    }

    /// Bold red used for matched substrings.
    pub fn highlight(&self) -> Color {
        self.fixed("31;1")
    }

    fn fixed(&self, sgr: &str) -> Color {
        if self.enabled {
            Color::new(sgr)
        } else {
            Color::none()
        }
    }

    fn index_of(&self, name: &str) -> usize {
        (xxh3_64(name.as_bytes()) % self.pairs.len() as u64) as usize
    }
}

fn parse_sgr(s: &str) -> Result<Color, ColorError> {
    let mut parts = Vec::new();
    for part in s.split(';') {
        let attr: u16 = part
            .trim()
            .parse()
            .map_err(|_| ColorError::InvalidSgr(s.to_string()))?;
        parts.push(attr.to_string());
    }
    Ok(Color::new(parts.join(";")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_wraps_in_escape() {
        let c = Color::new("31;1");
        assert_eq!(c.paint("boom"), "\x1b[31;1mboom\x1b[0m");
        assert_eq!(Color::none().paint("boom"), "boom");
    }

    #[test]
    fn test_for_target_is_deterministic() {
        let palette = Palette::standard(true);
        let first = palette.for_target("cont1", "comp1");
        let second = palette.for_target("cont1", "comp1");
        assert_eq!(first, second);
    }

    #[test]
    fn test_for_target_without_compose_uses_first_pair() {
        let palette = Palette::standard(true);
        let (ns1, _) = palette.for_target("cont1", "");
        let (ns2, _) = palette.for_target("cont2", "");
        assert_eq!(ns1, ns2);
    }

    #[test]
    fn test_disabled_palette_paints_nothing() {
        let palette = Palette::standard(false);
        let (ns, c) = palette.for_target("cont1", "comp1");
        assert_eq!(ns.paint("x"), "x");
        assert_eq!(c.paint("x"), "x");
        assert_eq!(palette.banner_start().paint("+"), "+");
    }

    #[test]
    fn test_from_sgr_lists_defaults_container_to_namespace() {
        let palette =
            Palette::from_sgr_lists(&["91".into(), "92".into()], &[], true).unwrap();
        let (_, c) = palette.for_target("a", "");
        assert!(c == Color::new("91") || c == Color::new("92"));
    }

    #[test]
    fn test_from_sgr_lists_rejects_bad_input() {
        assert!(matches!(
            Palette::from_sgr_lists(&[], &[], true),
            Err(ColorError::EmptyNamespaceColors)
        ));
        assert!(matches!(
            Palette::from_sgr_lists(&["91".into()], &["92".into(), "93".into()], true),
            Err(ColorError::LengthMismatch)
        ));
        assert!(matches!(
            Palette::from_sgr_lists(&["red".into()], &[], true),
            Err(ColorError::InvalidSgr(_))
        ));
    }

    #[test]
    fn test_parse_sgr_accepts_compound_sequences() {
        let c = parse_sgr("31; 4").unwrap();
        assert_eq!(c.as_sgr(), "31;4");
    }
}
