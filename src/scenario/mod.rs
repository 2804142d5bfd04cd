use std::{future::Future, marker::PhantomData};

use typed_builder::TypedBuilder;

use crate::executor::{ExecutionSummary, Executor};

pub mod review;

/// Identity of one iteration: which virtual user runs it and how many it ran before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vu {
    pub id: usize,
    pub iteration: u64,
}

/// Glue between an executor and the work it repeats.
///
/// `action` is one full iteration of user behavior. It reports through the metric
/// handles it captured, so it returns nothing.
///
/// ```rust
/// use review_load::{Scenario, scenario::Vu};
///
/// let scenario = Scenario::builder()
///     .name("noop")
///     .action(|_vu: Vu| async {})
///     .build();
/// assert_eq!(scenario.name, "noop");
/// ```
#[derive(Clone, TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default, setter(skip))]
    iteration: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Scenario<F, Fut>
where
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send,
{
    pub async fn run<E: Executor<F, Fut>>(&self, executor: &E) -> Result<ExecutionSummary, E::Error> {
        executor.exec(self).await
    }
}
