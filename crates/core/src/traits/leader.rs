use async_trait::async_trait;

/// 多节点部署下保证定时作业只在一个节点触发
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// 单节点部署，始终是leader
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNodeLeader;

#[async_trait]
impl LeaderElection for SingleNodeLeader {
    async fn is_leader(&self) -> bool {
        true
    }
}
