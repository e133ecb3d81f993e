use std::fmt;

/// Collects every failure of a composite check instead of stopping at the
/// first one, so callers see all failing subsystems at once.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> MultiError {
        MultiError { errors: Vec::new() }
    }

    pub fn push<E>(&mut self, err: E)
    where
        E: Into<anyhow::Error>,
    {
        self.errors.push(err.into());
    }

    /// Records the error of `result`, if any.
    pub fn collect<T, E>(&mut self, result: Result<T, E>)
    where
        E: Into<anyhow::Error>,
    {
        if let Err(err) = result {
            self.push(err);
        }
    }

    /// Flattens the errors of a nested composite check into this one.
    pub fn absorb(&mut self, result: Result<(), MultiError>) {
        if let Err(other) = result {
            self.errors.extend(other.errors);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{:#}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
