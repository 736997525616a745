/// Runtime switches for the graph pipeline, read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphFlags {
    /// Run the structural verifier after every successful compile.
    pub strict: bool,
    /// Let the storage manager alias outputs onto inputs for kinds that ask
    /// for it. Off by default; the aliasing policy is not exercised yet.
    pub in_place: bool,
    /// Compute the input derivative of the first trainable node as well.
    pub derivative_for_first: bool,
}

impl Default for GraphFlags {
    fn default() -> Self {
        Self {
            strict: true,
            in_place: false,
            derivative_for_first: false,
        }
    }
}

impl GraphFlags {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            strict: read_bool("LAYERGRAPH_STRICT", defaults.strict),
            in_place: read_bool("LAYERGRAPH_IN_PLACE", defaults.in_place),
            derivative_for_first: read_bool(
                "LAYERGRAPH_DERIVATIVE_FOR_FIRST",
                defaults.derivative_for_first,
            ),
        }
    }
}

fn read_bool(key: &str, default_value: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use crate::flags::GraphFlags;

    #[test]
    fn defaults_keep_in_place_disabled() {
        let flags = GraphFlags::default();
        assert!(flags.strict);
        assert!(!flags.in_place);
        assert!(!flags.derivative_for_first);
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        let flags = GraphFlags::from_env();
        if std::env::var("LAYERGRAPH_IN_PLACE").is_err() {
            assert!(!flags.in_place);
        }
    }
}
