pub mod execute_command;

pub use execute_command::ExecuteCommandTool;
