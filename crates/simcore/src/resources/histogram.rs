/// Histogram that keeps only the non-empty bins.
///
/// The mesh covers `[min, max)` with `num = (max - min) / step` equally sized bins (at least one),
/// and every item lands in the rightmost bin whose left edge does not exceed its value.
#[derive(Debug)]
pub struct SparseHistogram<T> {
    bins: Vec<(f64, Vec<T>)>,
}

impl<T: Clone> SparseHistogram<T> {
    pub fn new<F: Fn(&T) -> f64>(items: &[T], key: F, step: f64) -> Self {
        if items.is_empty() {
            return SparseHistogram { bins: Vec::new() };
        }
        let values: Vec<f64> = items.iter().map(&key).collect();
        let start = values.iter().copied().fold(f64::INFINITY, f64::min);
        let stop = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let num = (((stop - start) / step) as usize).max(1);
        let width = (stop - start) / num as f64;

        let mut bins: Vec<(f64, Vec<T>)> = Vec::new();
        for (item, value) in items.iter().zip(values) {
            let pos = if width > 0.0 {
                (((value - start) / width).floor() as usize).min(num - 1)
            } else {
                0
            };
            let edge = start + pos as f64 * width;
            match bins.iter_mut().find(|(e, _)| *e == edge) {
                Some((_, bin)) => bin.push(item.clone()),
                None => bins.push((edge, vec![item.clone()])),
            }
        }
        bins.sort_by(|a, b| a.0.total_cmp(&b.0));
        SparseHistogram { bins }
    }

    /// Left edges of the non-empty bins in ascending order.
    pub fn edges(&self) -> impl Iterator<Item = f64> + '_ {
        self.bins.iter().map(|(edge, _)| *edge)
    }

    pub fn first(&self) -> Option<&[T]> {
        self.bins.first().map(|(_, items)| items.as_slice())
    }

    pub fn last(&self) -> Option<&[T]> {
        self.bins.last().map(|(_, items)| items.as_slice())
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }
}
