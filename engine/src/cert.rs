// cert.rs — Machine-checkable postcondition evidence
//
// Each verification step returns a certificate: a struct of named boolean
// obligations. Callers check `all_pass()` and report the failing names.

/// Evidence that a stage's postconditions hold.
pub trait StageCert {
    /// True when every obligation holds.
    fn all_pass(&self) -> bool;

    /// Every obligation by name, with whether it holds.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of failing obligations.
    fn failures(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}
