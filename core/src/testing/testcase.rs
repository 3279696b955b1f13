use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;

/// Per-case settings, already merged with the batch and problem defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseConfig {
    /// bytes
    pub output_limit_length: usize,
    pub wall_time_factor: f64,
    /// link name => target file
    pub symlinks: BTreeMap<String, PathBuf>,
}

impl CaseConfig {
    pub const DEFAULT_OUTPUT_LIMIT_LENGTH: usize = 25165824;
    pub const DEFAULT_WALL_TIME_FACTOR: f64 = 3.0;
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            output_limit_length: Self::DEFAULT_OUTPUT_LIMIT_LENGTH,
            wall_time_factor: Self::DEFAULT_WALL_TIME_FACTOR,
            symlinks: BTreeMap::new(),
        }
    }
}

/// Bytes that are either held in memory or read from a file on first access.
#[derive(Debug)]
pub enum DataSource {
    File {
        path: PathBuf,
        cache: OnceCell<Vec<u8>>,
    },
    Memory(Vec<u8>),
}

impl DataSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            cache: OnceCell::new(),
        }
    }

    pub fn memory(data: impl Into<Vec<u8>>) -> Self {
        Self::Memory(data.into())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory(_) => None,
        }
    }

    pub fn bytes(&self) -> fsutil::Result<&[u8]> {
        match self {
            Self::File { path, cache } => cache
                .get_or_try_init(|| fsutil::read(path))
                .map(Vec::as_slice),
            Self::Memory(data) => Ok(data.as_slice()),
        }
    }
}

/// Contents of one case before it is numbered and placed in the tree.
#[derive(Debug)]
pub struct CaseData {
    pub input: DataSource,
    pub expected_output: Option<DataSource>,
    pub points: f64,
    pub config: CaseConfig,
}

impl CaseData {
    pub fn new(input: DataSource) -> Self {
        Self {
            input,
            expected_output: None,
            points: 0.0,
            config: CaseConfig::default(),
        }
    }

    pub fn expected_output(mut self, data: DataSource) -> Self {
        self.expected_output = Some(data);
        self
    }

    pub fn points(mut self, points: f64) -> Self {
        self.points = points;
        self
    }

    pub fn config(mut self, config: CaseConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug)]
pub struct TestCase {
    pub batch_number: Option<u32>,
    /// 1-based, within the batch or within the top level
    pub position: u32,
    pub points: f64,
    pub config: CaseConfig,
    input: DataSource,
    expected_output: Option<DataSource>,
}

impl TestCase {
    pub fn input_data(&self) -> fsutil::Result<&[u8]> {
        self.input.bytes()
    }

    pub fn input_source(&self) -> &DataSource {
        &self.input
    }

    pub fn expected_output(&self) -> Option<fsutil::Result<&[u8]>> {
        self.expected_output.as_ref().map(DataSource::bytes)
    }
}

#[derive(Debug)]
pub struct BatchedTestCase {
    pub batch_number: u32,
    pub position: u32,
    pub points: f64,
    pub batched_cases: Vec<TestCase>,
}

#[derive(Debug)]
pub enum TestCaseNode {
    Single(TestCase),
    Batch(BatchedTestCase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Batch at position {0} has no cases")]
pub struct EmptyBatchError(pub u32);

/// Test cases of a problem in declaration order.
#[derive(Debug, Default)]
pub struct TestCaseTree {
    nodes: Vec<TestCaseNode>,
}

impl TestCaseTree {
    pub fn builder() -> TestCaseTreeBuilder {
        TestCaseTreeBuilder::default()
    }

    pub fn nodes(&self) -> &[TestCaseNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All cases in one linear pass, each with its batch number.
    pub fn flatten(&self) -> Vec<(Option<u32>, &TestCase)> {
        let mut res = Vec::new();
        for node in &self.nodes {
            match node {
                TestCaseNode::Single(case) => res.push((None, case)),
                TestCaseNode::Batch(batch) => res.extend(
                    batch
                        .batched_cases
                        .iter()
                        .map(|case| (Some(batch.batch_number), case)),
                ),
            }
        }
        res
    }
}

#[derive(Debug, Default)]
pub struct TestCaseTreeBuilder {
    nodes: Vec<TestCaseNode>,
    batch_count: u32,
}

impl TestCaseTreeBuilder {
    fn next_position(&self) -> u32 {
        self.nodes.len() as u32 + 1
    }

    pub fn case(mut self, data: CaseData) -> Self {
        let case = make_case(data, None, self.next_position());
        self.nodes.push(TestCaseNode::Single(case));
        self
    }

    pub fn batch(
        mut self,
        points: f64,
        cases: impl IntoIterator<Item = CaseData>,
    ) -> Result<Self, EmptyBatchError> {
        let position = self.next_position();
        let batch_number = self.batch_count + 1;
        let batched_cases: Vec<_> = cases
            .into_iter()
            .enumerate()
            .map(|(i, data)| make_case(data, Some(batch_number), i as u32 + 1))
            .collect();
        if batched_cases.is_empty() {
            return Err(EmptyBatchError(position));
        }
        self.batch_count = batch_number;
        self.nodes.push(TestCaseNode::Batch(BatchedTestCase {
            batch_number,
            position,
            points,
            batched_cases,
        }));
        Ok(self)
    }

    pub fn build(self) -> TestCaseTree {
        TestCaseTree { nodes: self.nodes }
    }
}

fn make_case(data: CaseData, batch_number: Option<u32>, position: u32) -> TestCase {
    let CaseData {
        input,
        expected_output,
        points,
        config,
    } = data;
    TestCase {
        batch_number,
        position,
        points,
        config,
        input,
        expected_output,
    }
}

/// Splits `items` into maximal runs of equal keys, keeping order.
///
/// Equal keys that are not adjacent start a new run.
/// ```
/// use kvalid_core::testing::contiguous_runs;
///
/// let keys = [None, Some(1), Some(1), Some(2), Some(2), None];
/// let runs: Vec<_> = contiguous_runs(&keys, |k| *k)
///     .into_iter()
///     .map(|(k, run)| (k, run.len()))
///     .collect();
/// assert_eq!(runs, vec![(None, 1), (Some(1), 2), (Some(2), 2), (None, 1)]);
/// ```
pub fn contiguous_runs<T, K, F>(items: &[T], key: F) -> Vec<(K, &[T])>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut runs = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let k = key(&items[start]);
        let mut end = start + 1;
        while end < items.len() && key(&items[end]) == k {
            end += 1;
        }
        runs.push((k, &items[start..end]));
        start = end;
    }
    runs
}

#[cfg(test)]
mod test {
    use super::*;

    fn data(input: &str) -> CaseData {
        CaseData::new(DataSource::memory(input)).points(1.0)
    }

    fn sample_tree() -> TestCaseTree {
        TestCaseTree::builder()
            .case(data("a"))
            .batch(10.0, [data("b1"), data("b2")])
            .unwrap()
            .batch(20.0, [data("c1"), data("c2")])
            .unwrap()
            .case(data("d"))
            .build()
    }

    #[test]
    fn flatten_keeps_declaration_order() {
        let tree = sample_tree();
        let flat = tree.flatten();
        let inputs: Vec<_> = flat
            .iter()
            .map(|(_, c)| std::str::from_utf8(c.input_data().unwrap()).unwrap())
            .collect();
        assert_eq!(inputs, ["a", "b1", "b2", "c1", "c2", "d"]);

        let batches: Vec<_> = flat.iter().map(|(b, _)| *b).collect();
        assert_eq!(batches, [None, Some(1), Some(1), Some(2), Some(2), None]);
    }

    #[test]
    fn positions_are_one_based_per_level() {
        let tree = sample_tree();
        let positions: Vec<_> = tree
            .flatten()
            .iter()
            .map(|(_, c)| (c.batch_number, c.position))
            .collect();
        assert_eq!(
            positions,
            [
                (None, 1),
                (Some(1), 1),
                (Some(1), 2),
                (Some(2), 1),
                (Some(2), 2),
                (None, 4)
            ]
        );
    }

    #[test]
    fn grouping_by_contiguous_runs() {
        let tree = sample_tree();
        let flat = tree.flatten();
        let runs: Vec<_> = contiguous_runs(&flat, |(b, _)| *b)
            .into_iter()
            .map(|(b, run)| (b, run.len()))
            .collect();
        assert_eq!(runs, [(None, 1), (Some(1), 2), (Some(2), 2), (None, 1)]);
    }

    #[test]
    fn same_key_apart_is_two_runs() {
        let runs = contiguous_runs(&[1, 1, 2, 1], |x| *x);
        assert_eq!(runs.len(), 3);
        assert!(contiguous_runs(&[] as &[i32], |x| *x).is_empty());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = TestCaseTree::builder()
            .case(data("a"))
            .batch(1.0, [])
            .unwrap_err();
        assert_eq!(err, EmptyBatchError(2));
    }

    #[test]
    fn input_file_is_read_lazily_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.in");
        let tree = TestCaseTree::builder()
            .case(CaseData::new(DataSource::file(&path)))
            .build();
        let (_, case) = tree.flatten()[0];

        // not read at construction time
        assert!(case.input_data().is_err());
        fsutil::write(&path, "5\n1 2 3 4 5\n").unwrap();
        assert_eq!(case.input_data().unwrap(), b"5\n1 2 3 4 5\n");

        fsutil::write(&path, "changed").unwrap();
        assert_eq!(case.input_data().unwrap(), b"5\n1 2 3 4 5\n");
    }
}
