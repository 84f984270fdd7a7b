bitflags::bitflags! {
    /// Per call behaviour switches of manager operations.
    ///
    /// Flags compose with `|`:
    ///
    /// ```rust
    /// use kiln::Flags;
    ///
    /// let flags = Flags::NO_TRANSACTION | Flags::NO_VALIDATION;
    /// assert!(flags.contains(Flags::NO_VALIDATION));
    /// assert!(!flags.contains(Flags::TEXT_SCORE_SORT));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// Allow a multi document read to run without a transaction. Documents
        /// moved by concurrent writes may be missed or returned twice.
        const NO_TRANSACTION = 0b0000_0001;
        /// Skip the validation of read and written models.
        const NO_VALIDATION = 0b0000_0010;
        /// Sort by text score first and expose the score on the models.
        const TEXT_SCORE_SORT = 0b0000_0100;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

impl Flags {
    /// Returns whether a transaction may be skipped.
    pub fn no_transaction(&self) -> bool {
        self.contains(Flags::NO_TRANSACTION)
    }

    pub fn no_validation(&self) -> bool {
        self.contains(Flags::NO_VALIDATION)
    }

    pub fn text_score_sort(&self) -> bool {
        self.contains(Flags::TEXT_SCORE_SORT)
    }
}
