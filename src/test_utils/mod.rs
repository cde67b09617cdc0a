pub mod mock;

pub use mock::{MockCpu, MockHal, MockInvalidator, MockMachine, MockVmx};
