mod frontier;
mod termination;
