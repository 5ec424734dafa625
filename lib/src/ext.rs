use itertools::Itertools;

/// Implements `priority_find` for collections.
pub trait PriorityFind<T> {
    /// Searches through a list of items using the provided prioritization function.
    /// Priorities are such that a lower number is higher priority, meaning that `0` is the highest possible priority.
    ///
    /// As the search is performed:
    /// - If an item with the lowest priority is found, it is immediately returned and the rest of the search is aborted.
    /// - Otherwise, the highest priority item found is retained until the end of the search, at which point it is returned.
    ///
    /// Platform selection leans on the second property: among index entries
    /// of equal rank, the one listed first wins.
    fn priority_find<F: Fn(&T) -> usize>(self, prioritize: F) -> Option<T>;
}

impl<T, I> PriorityFind<T> for I
where
    I: Iterator<Item = T>,
{
    fn priority_find<F: Fn(&T) -> usize>(self, prioritize: F) -> Option<T> {
        priority_find(self, prioritize)
    }
}

/// Searches through a list of items using a priority function returning a non-negative number.
/// Priorities are such that a lower number is higher priority, meaning that `0` is the highest possible priority.
fn priority_find<T, F: Fn(&T) -> usize>(
    items: impl IntoIterator<Item = T>,
    prioritize: F,
) -> Option<T> {
    items
        .into_iter()
        .map(|item| (prioritize(&item), item))
        // Stop scanning entirely once a priority-0 item appears;
        // anything later can at best tie, and ties go to the earlier item.
        .take_while_inclusive(|(priority, _)| *priority > 0)
        .fold(None, |result, (incoming, item)| match result {
            None => Some((incoming, item)),
            Some((current, _)) => {
                if current > incoming {
                    Some((incoming, item))
                } else {
                    result
                }
            }
        })
        .map(|(_, item)| item)
}
