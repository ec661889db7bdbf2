//! Construction of collectives from configuration.
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use crate::dataflow::DataFlow;
use crate::network::Transport;
use crate::prelude::*;
use crate::receiver::MessageReceiver;
use crate::routing::{
    BroadcastRouter, KeyedRouter, LoadBalanceRouter, PartitionRouter, Router, RoutingError,
};
use crate::serialize::Payload;
use crate::store::StoreManager;
use crate::types::{CommsConfig, TaskPlan};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Broadcast,
    Partition,
    LoadBalance,
    KeyedReduce,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation kind {0:?}")]
pub struct UnknownOperationKind(String);

impl FromStr for OperationKind {
    type Err = UnknownOperationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use OperationKind::*;

        let name = s.trim().to_ascii_lowercase().replace(&['_', '-'][..], "");
        match name.as_str() {
            "broadcast" => Ok(Broadcast),
            "partition" => Ok(Partition),
            "loadbalance" => Ok(LoadBalance),
            "keyedreduce" => Ok(KeyedReduce),
            _ => Err(UnknownOperationKind(s.to_string())),
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Broadcast => "broadcast",
            OperationKind::Partition => "partition",
            OperationKind::LoadBalance => "load-balance",
            OperationKind::KeyedReduce => "keyed-reduce",
        };

        f.write_str(name)
    }
}

/// Builds the collectives of one executor. Every executor taking part in a collective has to
/// build it with the same kind, edge, sources and destinations.
pub struct Communicator {
    config: CommsConfig,
    plan: TaskPlan,
    transport: Arc<dyn Transport>,
    stores: Option<StoreManager>,
}

impl Communicator {
    pub fn new(config: CommsConfig, plan: TaskPlan, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let stores = match &config.store_dir {
            Some(dir) if config.store_based => Some(StoreManager::new(dir)?),
            _ => None,
        };

        debug!("communicator of {} with {:?}", plan.this_executor(), config);

        Ok(Self {
            config,
            plan,
            transport,
            stores,
        })
    }

    /// Communicator configured from the `DATAFLOW_*` environment variables.
    pub fn from_env(plan: TaskPlan, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(CommsConfig::from_env(), plan, transport)
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }

    pub fn router(
        &self,
        kind: OperationKind,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
    ) -> Result<Router, RoutingError> {
        let plan = self.plan.clone();

        Ok(match kind {
            OperationKind::Broadcast => {
                Router::Broadcast(BroadcastRouter::new(plan, sources, destinations)?)
            }
            OperationKind::Partition => {
                Router::Partition(PartitionRouter::new(plan, sources, destinations)?)
            }
            OperationKind::LoadBalance => {
                Router::LoadBalance(LoadBalanceRouter::new(plan, sources, destinations)?)
            }
            OperationKind::KeyedReduce => {
                Router::KeyedReduce(KeyedRouter::new(plan, sources, destinations)?)
            }
        })
    }

    pub fn build<T: Payload>(
        &self,
        kind: OperationKind,
        edge: EdgeId,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
        receiver: Box<dyn MessageReceiver<T>>,
    ) -> Result<Arc<DataFlow<T>>> {
        let router = self.router(kind, sources, destinations)?;
        let mut config = self.config.clone();

        if kind == OperationKind::KeyedReduce {
            config.keyed = true;
        }

        let flow = DataFlow::new(
            router,
            config,
            edge,
            receiver,
            Arc::clone(&self.transport),
            self.stores.as_ref(),
        )?;

        Ok(Arc::new(flow))
    }
}
