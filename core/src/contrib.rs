use std::collections::BTreeMap;

/// Argument convention of a family of validators.
pub trait ContribModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Template used when the problem does not give `args_format_string`.
    fn default_args_format_string(&self) -> &'static str;
}

/// `<validator> <batch_no> <case_no>`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContrib;

impl ContribModule for DefaultContrib {
    fn name(&self) -> &'static str {
        "default"
    }

    fn default_args_format_string(&self) -> &'static str {
        "{batch_no} {case_no}"
    }
}

/// testlib.h validators, which take the test group via `--group`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestlibContrib;

impl ContribModule for TestlibContrib {
    fn name(&self) -> &'static str {
        "testlib"
    }

    fn default_args_format_string(&self) -> &'static str {
        "--group st{batch_no}"
    }
}

pub struct ContribRegistry {
    modules: BTreeMap<&'static str, Box<dyn ContribModule>>,
}

impl Default for ContribRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ContribRegistry {
    pub const DEFAULT: &str = "default";

    pub fn builtin() -> Self {
        let mut reg = Self {
            modules: BTreeMap::new(),
        };
        reg.register(Box::new(DefaultContrib));
        reg.register(Box::new(TestlibContrib));
        reg
    }

    pub fn register(&mut self, module: Box<dyn ContribModule>) {
        self.modules.insert(module.name(), module);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ContribModule> {
        self.modules.get(name).map(Box::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }
}
