/// Replication engine configuration
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Byte budget for one view's replica updates per server tick
    pub update_byte_budget: usize,
    /// Lower bound for the client-side inactivity timeout, seconds. The
    /// per-replica window (30x its desired update interval) never drops
    /// below this.
    pub min_inactivity_timeout: f32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            update_byte_budget: 1200,
            min_inactivity_timeout: 3.0,
        }
    }
}

impl ReplicationConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(budget) = std::env::var("UPDATE_BYTE_BUDGET") {
            if let Ok(parsed) = budget.parse::<usize>() {
                if parsed > 0 {
                    config.update_byte_budget = parsed;
                } else {
                    tracing::warn!("UPDATE_BYTE_BUDGET must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid UPDATE_BYTE_BUDGET '{}', using default", budget);
            }
        }

        if let Ok(timeout) = std::env::var("MIN_INACTIVITY_TIMEOUT") {
            if let Ok(parsed) = timeout.parse::<f32>() {
                if parsed > 0.0 {
                    config.min_inactivity_timeout = parsed;
                } else {
                    tracing::warn!("MIN_INACTIVITY_TIMEOUT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid MIN_INACTIVITY_TIMEOUT '{}', using default", timeout);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.update_byte_budget == 0 {
            return Err("update_byte_budget must be at least 1".to_string());
        }
        if self.update_byte_budget > crate::net::protocol::MAX_MESSAGE_SIZE {
            return Err(format!(
                "update_byte_budget cannot exceed the {}-byte message cap",
                crate::net::protocol::MAX_MESSAGE_SIZE
            ));
        }
        if !self.min_inactivity_timeout.is_finite() || self.min_inactivity_timeout <= 0.0 {
            return Err("min_inactivity_timeout must be positive".to_string());
        }
        Ok(())
    }
}
