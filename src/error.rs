//! Error types for the encode pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The device lacks a feature the configuration requires.
    ///
    /// Only raised while constructing the pipeline, never per frame.
    #[error("Device capability missing: {0}")]
    Capability(String),

    /// A blocking wait on a pool node or fence did not finish in time.
    #[error("Timed out waiting for {0}")]
    PoolTimeout(String),

    /// A growable pool reached its hard cap.
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    /// Resource creation failed (images, buffers, fences, command pools, etc.).
    #[error("Failed to create resource: {0}")]
    ResourceCreation(String),

    /// Command buffer recording failed.
    #[error("Command buffer error: {0}")]
    CommandBuffer(String),

    /// Queue submission was rejected by the driver.
    #[error("Queue submission failed: {0}")]
    Submission(String),

    /// An encode query finished with a status other than complete.
    #[error("Encode query did not complete: {0}")]
    QueryIncomplete(String),

    /// Fence or semaphore state was not what the stage expected.
    #[error("Synchronization error: {0}")]
    Synchronization(String),

    /// A frame would be encoded before one of its references.
    #[error("Reference ordering violated: {0}")]
    ReferenceOrder(String),

    /// The async batch queue has been shut down.
    #[error("Encode queue closed: {0}")]
    QueueClosed(String),

    /// Invalid input (configuration, dimensions, frame state, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Writing to the output sink failed.
    #[error("Output sink error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(ash::vk::Result),
}

impl From<ash::vk::Result> for PipelineError {
    fn from(result: ash::vk::Result) -> Self {
        PipelineError::Vulkan(result)
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_vk_result_conversion() {
        let err: PipelineError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, PipelineError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let err: PipelineError = io.into();
        assert!(err.to_string().starts_with("Output sink error"));
    }
}
