/// Vendor and brand tokens stripped during normalization. Providers disagree
/// about how much marketing text belongs in a GPU name.
const VENDOR_TOKENS: &[&str] = &["NVIDIA", "GEFORCE", "TESLA", "QUADRO", "AMD", "RADEON"];

/// Normalize a provider-reported GPU name to a canonical form.
///
/// Uppercases, drops vendor/brand tokens, and collapses whitespace, so that
/// "NVIDIA GeForce RTX 4090", "RTX 4090" and "rtx  4090" all compare equal.
pub fn normalize_gpu_name(raw: &str) -> String {
    raw.to_uppercase()
        .split_whitespace()
        .filter(|tok| !VENDOR_TOKENS.contains(tok))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vendor_prefixes() {
        assert_eq!(normalize_gpu_name("NVIDIA GeForce RTX 4090"), "RTX 4090");
        assert_eq!(normalize_gpu_name("Tesla V100"), "V100");
        assert_eq!(normalize_gpu_name("NVIDIA A100 SXM4"), "A100 SXM4");
    }

    #[test]
    fn collapses_whitespace_and_case() {
        assert_eq!(normalize_gpu_name("rtx   4090"), "RTX 4090");
        assert_eq!(normalize_gpu_name(" RTX 4090 "), "RTX 4090");
    }

    #[test]
    fn already_canonical_names_are_unchanged() {
        assert_eq!(normalize_gpu_name("H100"), "H100");
        assert_eq!(normalize_gpu_name("RTX 4090"), "RTX 4090");
    }
}
