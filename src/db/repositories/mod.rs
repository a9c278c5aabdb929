mod daily_steps;
mod workouts;
