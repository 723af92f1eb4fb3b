use crate::error::CacheError;

/// A result that is either available now or needs one more resolution step.
///
/// Sources hand these to the executor so that an in-memory source (always `Immediate`)
/// and a batched store source (`Deferred` until the batch is fetched) look the same.
pub enum DeferredValue<'a, T> {
    Immediate(Result<T, CacheError>),
    Deferred(Box<dyn FnOnce() -> Result<T, CacheError> + 'a>),
}

impl<'a, T: 'a> DeferredValue<'a, T> {
    pub fn immediate(value: T) -> Self {
        DeferredValue::Immediate(Ok(value))
    }

    pub fn error(error: CacheError) -> Self {
        DeferredValue::Immediate(Err(error))
    }

    pub fn deferred(resolve: impl FnOnce() -> Result<T, CacheError> + 'a) -> Self {
        DeferredValue::Deferred(Box::new(resolve))
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, DeferredValue::Immediate(_))
    }

    /// Forces the value, running the resolution step if there is one.
    pub fn get(self) -> Result<T, CacheError> {
        match self {
            DeferredValue::Immediate(result) => result,
            DeferredValue::Deferred(resolve) => resolve(),
        }
    }

    pub fn map<U: 'a>(self, f: impl FnOnce(T) -> U + 'a) -> DeferredValue<'a, U> {
        match self {
            DeferredValue::Immediate(result) => DeferredValue::Immediate(result.map(f)),
            DeferredValue::Deferred(resolve) => DeferredValue::deferred(move || resolve().map(f)),
        }
    }

    pub fn try_map<U: 'a>(self, f: impl FnOnce(T) -> Result<U, CacheError> + 'a) -> DeferredValue<'a, U> {
        match self {
            DeferredValue::Immediate(result) => DeferredValue::Immediate(result.and_then(f)),
            DeferredValue::Deferred(resolve) => DeferredValue::deferred(move || resolve().and_then(f)),
        }
    }

    /// Chains a step that may itself defer. Applied eagerly when `self` is immediate.
    pub fn flat_map<U: 'a>(self, f: impl FnOnce(T) -> DeferredValue<'a, U> + 'a) -> DeferredValue<'a, U> {
        match self {
            DeferredValue::Immediate(Ok(value)) => f(value),
            DeferredValue::Immediate(Err(e)) => DeferredValue::Immediate(Err(e)),
            DeferredValue::Deferred(resolve) => DeferredValue::deferred(move || f(resolve()?).get()),
        }
    }

    pub fn or_else(self, f: impl FnOnce(CacheError) -> Result<T, CacheError> + 'a) -> DeferredValue<'a, T> {
        match self {
            DeferredValue::Immediate(result) => DeferredValue::Immediate(result.or_else(f)),
            DeferredValue::Deferred(resolve) => DeferredValue::deferred(move || resolve().or_else(f)),
        }
    }

    pub fn zip<U: 'a>(self, other: DeferredValue<'a, U>) -> DeferredValue<'a, (T, U)> {
        match (self, other) {
            (DeferredValue::Immediate(a), DeferredValue::Immediate(b)) => DeferredValue::Immediate(a.and_then(|a| b.map(|b| (a, b)))),
            (a, b) => DeferredValue::deferred(move || Ok((a.get()?, b.get()?))),
        }
    }

    /// Immediate when every element is; otherwise resolves the elements in order.
    pub fn collect(values: Vec<DeferredValue<'a, T>>) -> DeferredValue<'a, Vec<T>> {
        if values.iter().all(DeferredValue::is_immediate) {
            DeferredValue::Immediate(values.into_iter().map(DeferredValue::get).collect())
        } else {
            DeferredValue::deferred(move || values.into_iter().map(DeferredValue::get).collect())
        }
    }
}

impl<'a, T> From<Result<T, CacheError>> for DeferredValue<'a, T> {
    fn from(result: Result<T, CacheError>) -> Self {
        DeferredValue::Immediate(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn immediate_combinators_stay_immediate() {
        let v = DeferredValue::immediate(2).map(|x| x * 10).try_map(|x| Ok(x + 1));
        assert!(v.is_immediate());
        assert_eq!(v.get().unwrap(), 21);

        let zipped = DeferredValue::immediate(1).zip(DeferredValue::immediate("a"));
        assert!(zipped.is_immediate());
        assert_eq!(zipped.get().unwrap(), (1, "a"));
    }

    #[test]
    fn deferred_runs_only_when_forced() {
        let calls = Cell::new(0);
        let v = DeferredValue::deferred(|| {
            calls.set(calls.get() + 1);
            Ok(5)
        })
        .map(|x| x * 2);
        assert_eq!(calls.get(), 0);
        assert!(!v.is_immediate());
        assert_eq!(v.get().unwrap(), 10);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn flat_map_is_eager_for_immediate_values() {
        let calls = Cell::new(0);
        let v = DeferredValue::immediate(3).flat_map(|x| {
            calls.set(calls.get() + 1);
            DeferredValue::immediate(x + 1)
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(v.get().unwrap(), 4);

        let chained = DeferredValue::deferred(|| Ok(1)).flat_map(|x| DeferredValue::deferred(move || Ok(x + 1)));
        assert_eq!(chained.get().unwrap(), 2);
    }

    #[test]
    fn errors_short_circuit_and_recover() {
        let failed: DeferredValue<'_, i32> = DeferredValue::error(CacheError::custom("boom"));
        assert!(failed.map(|x| x + 1).get().is_err());

        let recovered: DeferredValue<'_, i32> = DeferredValue::deferred(|| Err(CacheError::custom("boom"))).or_else(|_| Ok(7));
        assert_eq!(recovered.get().unwrap(), 7);

        let zipped = DeferredValue::immediate(1).zip(DeferredValue::<i32>::error(CacheError::custom("right")));
        assert!(zipped.get().is_err());
    }

    #[test]
    fn collect_keeps_order() {
        let all = DeferredValue::collect(vec![DeferredValue::immediate(1), DeferredValue::deferred(|| Ok(2)), DeferredValue::immediate(3)]);
        assert!(!all.is_immediate());
        assert_eq!(all.get().unwrap(), vec![1, 2, 3]);
        assert!(DeferredValue::collect(vec![DeferredValue::immediate(1)]).is_immediate());
    }
}
