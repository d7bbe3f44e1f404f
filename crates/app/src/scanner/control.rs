use anyhow::Result;

/// Narrow command interface used by the menu and the console. Anything that
/// implements it can stand in for the running scanner.
pub(crate) trait ScannerCommands {
    fn start_scan(&self);
    fn stop_scan(&self);
    /// Start the web stream; fails when the server cannot bind.
    fn start_stream(&self) -> Result<()>;
    fn stop_stream(&self);
    fn shutdown(&self);
    fn is_scanning(&self) -> bool;
    fn is_streaming_web(&self) -> bool;
}
