use log::info;

use super::{EnvManager, EnvStatus, Kernel};
use crate::ulib::syscall::UserEnv;

impl EnvManager {
    /// Round robin: the first runnable slot after the current one, else the
    /// current environment if it is still running.
    pub fn sched_pick(&self) -> Option<usize> {
        let start = self.cur_env_ind.map_or(0, |ind| ind + 1);
        let next = (0..self.nenv)
            .map(|i| (start + i) % self.nenv)
            .find(|&ind| self.envs[ind].env_status == EnvStatus::Runnable);
        next.or_else(|| self.cur_env_ind.filter(|&ind| self.envs[ind].env_status == EnvStatus::Running))
    }
}

impl Kernel {
    /// Hand the CPU to the next environment, or `None` when nothing can run.
    pub fn sched_yield(&self) -> Option<UserEnv<'_>> {
        let em = self.lock();
        match em.sched_pick() {
            Some(ind) => Some(self.env_run(em, ind)),
            None => {
                info!("no runnable environments");
                None
            }
        }
    }
}
