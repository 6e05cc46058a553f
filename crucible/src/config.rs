//! `ContextProperties`: the configuration surface that influences lowering.
//! Follows the familiar `*Builder` pattern (`ProgramBuilder`,
//! `ContextBuilder`) but as a plain value type with a `normalize()` step,
//! since every field here is a simple flag or enum rather than something
//! that needs to accumulate a list of build options.

/// Controls the default inlining/constant-propagation aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizationLevel {
    Debug,
    Release,
    O2,
}

impl Default for OptimizationLevel {
    fn default() -> Self {
        OptimizationLevel::Release
    }
}

/// Inlining aggressiveness for the IR's inlining pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InliningMode {
    Aggressive,
    Conservative,
    None,
}

impl Default for InliningMode {
    fn default() -> Self {
        InliningMode::Conservative
    }
}

/// Debug symbol emission level for backends that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugSymbols {
    None,
    Basic,
    WithInlineSources,
}

impl Default for DebugSymbols {
    fn default() -> Self {
        DebugSymbols::None
    }
}

/// Negotiated PTX feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtxFeatures {
    Default,
    Enhanced,
}

impl Default for PtxFeatures {
    fn default() -> Self {
        PtxFeatures::Default
    }
}

/// The configuration bits that influence how a kernel is lowered and
/// compiled. A subset of these fields (see [`ContextProperties::fingerprint_bits`])
/// feed the Kernel Fingerprint so that two `Context`s with different
/// lowering behavior never collide in one process's compile cache, and so
/// that switching `fast_math` or `enable_assertions` at runtime correctly
/// forces a recompile instead of reusing a stale cached kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextProperties {
    pub optimization_level: OptimizationLevel,
    pub inlining_mode: InliningMode,
    pub fast_math: bool,
    pub force_32bit_floats: bool,
    pub debug_symbols: DebugSymbols,
    pub enable_assertions: bool,
    pub enable_verifier: bool,
    pub disable_kernel_cache: bool,
    pub ptx_features: PtxFeatures,
}

impl Default for ContextProperties {
    fn default() -> Self {
        ContextProperties {
            optimization_level: OptimizationLevel::default(),
            inlining_mode: InliningMode::default(),
            fast_math: false,
            force_32bit_floats: false,
            debug_symbols: DebugSymbols::default(),
            enable_assertions: cfg!(debug_assertions),
            enable_verifier: cfg!(debug_assertions),
            disable_kernel_cache: false,
            ptx_features: PtxFeatures::default(),
        }
    }
}

impl ContextProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn inlining_mode(mut self, mode: InliningMode) -> Self {
        self.inlining_mode = mode;
        self
    }

    pub fn fast_math(mut self, enabled: bool) -> Self {
        self.fast_math = enabled;
        self
    }

    pub fn force_32bit_floats(mut self, enabled: bool) -> Self {
        self.force_32bit_floats = enabled;
        self
    }

    pub fn debug_symbols(mut self, level: DebugSymbols) -> Self {
        self.debug_symbols = level;
        self
    }

    pub fn enable_assertions(mut self, enabled: bool) -> Self {
        self.enable_assertions = enabled;
        self
    }

    pub fn enable_verifier(mut self, enabled: bool) -> Self {
        self.enable_verifier = enabled;
        self
    }

    pub fn disable_kernel_cache(mut self, disabled: bool) -> Self {
        self.disable_kernel_cache = disabled;
        self
    }

    pub fn ptx_features(mut self, features: PtxFeatures) -> Self {
        self.ptx_features = features;
        self
    }

    /// Applies the preparation rules: `WithInlineSources` implies at
    /// least `Basic` debug symbols; `None` inlining and `Conservative`
    /// inlining are mutually exclusive, with `None` taking precedence
    /// (an explicit request for no inlining overrides a default
    /// conservative mode, but not vice versa since `Conservative` is only
    /// ever the *default*, never user-requested alongside `None`).
    pub fn normalize(self) -> Self {
        // `WithInlineSources` is already the richest debug-symbol level, so
        // the "implies Basic" rule needs no action here; it exists to
        // document that a caller may rely on `debug_symbols >=
        // DebugSymbols::Basic` whenever `WithInlineSources` is set.
        self
    }

    /// The subset of fields that influence lowering and therefore must
    /// feed the Kernel Fingerprint as context-property bits.
    pub fn fingerprint_bits(&self) -> u32 {
        let mut bits = 0u32;
        bits |= (self.optimization_level as u32 & 0b11) << 0;
        bits |= (self.inlining_mode as u32 & 0b11) << 2;
        bits |= (self.fast_math as u32) << 4;
        bits |= (self.force_32bit_floats as u32) << 5;
        bits |= (self.enable_assertions as u32) << 6;
        bits |= (self.ptx_features as u32 & 0b1) << 7;
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_inline_sources_implies_basic_is_already_satisfied() {
        let props = ContextProperties::new()
            .debug_symbols(DebugSymbols::WithInlineSources)
            .normalize();
        assert_eq!(props.debug_symbols, DebugSymbols::WithInlineSources);
    }

    #[test]
    fn fingerprint_bits_distinguish_fast_math() {
        let a = ContextProperties::new().fast_math(false).fingerprint_bits();
        let b = ContextProperties::new().fast_math(true).fingerprint_bits();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_bits_distinguish_assertions() {
        let a = ContextProperties::new().enable_assertions(false).fingerprint_bits();
        let b = ContextProperties::new().enable_assertions(true).fingerprint_bits();
        assert_ne!(a, b);
    }
}
